//! Configuration of the eventd daemon.

use std::{env, fmt, fs, io};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::{error, info, LevelFilter};
use serde::de;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::api::{ResourceKind, Subscription};
use crate::commons::storage::KeyValueStore;
use crate::constants::*;


//------------ ConfigDefaults ------------------------------------------------

pub struct ConfigDefaults;

impl ConfigDefaults {
    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
    }

    fn port() -> u16 {
        3010
    }

    fn storage_uri() -> Url {
        let uri = env::var(EVENTD_ENV_STORAGE_URI)
            .unwrap_or_else(|_| "memory://eventd".to_string());
        match Url::parse(&uri) {
            Ok(uri) => uri,
            Err(e) => {
                eprintln!(
                    "Invalid storage URI '{uri}' in env var \
                     {EVENTD_ENV_STORAGE_URI}: {e}"
                );
                ::std::process::exit(1);
            }
        }
    }

    fn key_prefix() -> String {
        DEFAULT_KEY_PREFIX.to_string()
    }

    fn log_level() -> LevelFilter {
        match env::var(EVENTD_ENV_LOG_LEVEL) {
            Ok(level) => match LevelFilter::from_str(&level) {
                Ok(level) => level,
                Err(_) => {
                    eprintln!(
                        "Unrecognized value for log level in env var {EVENTD_ENV_LOG_LEVEL}"
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LevelFilter::Info,
        }
    }

    fn log_type() -> LogType {
        match env::var(EVENTD_ENV_LOG_TYPE) {
            Ok(log_type) => match LogType::from_str(&log_type) {
                Ok(log_type) => log_type,
                Err(e) => {
                    eprintln!(
                        "Unrecognized value for log type in env var {EVENTD_ENV_LOG_TYPE}: {e}"
                    );
                    ::std::process::exit(1);
                }
            },
            _ => LogType::Stderr,
        }
    }

    fn log_file() -> PathBuf {
        PathBuf::from("./eventd.log")
    }

    fn syslog_facility() -> String {
        "daemon".to_string()
    }

    fn watch_resources() -> Vec<ResourceKind> {
        ResourceKind::ALL.to_vec()
    }

    fn watch_batch_size() -> usize {
        DEFAULT_WATCH_BATCH_SIZE
    }

    fn watch_retry_interval_ms() -> u64 {
        DEFAULT_WATCH_RETRY_INTERVAL_MS
    }

    fn leader_election() -> LeaderElection {
        LeaderElection::Always
    }

    fn leader_check_interval_secs() -> u64 {
        DEFAULT_LEADER_CHECK_INTERVAL_SECS
    }

    fn leader_lease_secs() -> u64 {
        DEFAULT_LEADER_LEASE_SECS
    }

    fn pop_timeout_secs() -> u64 {
        DEFAULT_POP_TIMEOUT_SECS
    }

    fn fused_event_expire_secs() -> u64 {
        DEFAULT_FUSED_EVENT_EXPIRE.as_secs()
    }

    fn default_callback_timeout_secs() -> u64 {
        DEFAULT_CALLBACK_TIMEOUT_SECS
    }

    fn subscriber_cursor_ttl_secs() -> u64 {
        DEFAULT_SUBSCRIBER_CURSOR_TTL_SECS
    }

    fn clean_interval_secs() -> u64 {
        DEFAULT_CLEAN_INTERVAL_SECS
    }

    fn trim_threshold() -> usize {
        DEFAULT_TRIM_THRESHOLD
    }

    fn delete_threshold() -> usize {
        DEFAULT_DELETE_THRESHOLD
    }

    fn clean_unit() -> usize {
        DEFAULT_CLEAN_UNIT
    }

    fn reconcile_interval_secs() -> u64 {
        DEFAULT_RECONCILE_INTERVAL_SECS
    }
}


//------------ Config --------------------------------------------------------

/// Global configuration for the eventd daemon.
///
/// Every setting has a default, so an empty file is a valid configuration
/// for a single node running on the in-process store.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "ConfigDefaults::ip")]
    pub ip: IpAddr,

    #[serde(default = "ConfigDefaults::port")]
    pub port: u16,

    #[serde(default = "ConfigDefaults::storage_uri")]
    pub storage_uri: Url,

    #[serde(default = "ConfigDefaults::key_prefix")]
    pub key_prefix: String,

    #[serde(
        default = "ConfigDefaults::log_level",
        deserialize_with = "de_level_filter"
    )]
    pub log_level: LevelFilter,

    #[serde(default = "ConfigDefaults::log_type")]
    pub log_type: LogType,

    #[serde(default = "ConfigDefaults::log_file")]
    pub log_file: PathBuf,

    #[serde(default = "ConfigDefaults::syslog_facility")]
    pub syslog_facility: String,

    #[serde(default = "ConfigDefaults::watch_resources")]
    pub watch_resources: Vec<ResourceKind>,

    #[serde(default = "ConfigDefaults::watch_batch_size")]
    pub watch_batch_size: usize,

    #[serde(default = "ConfigDefaults::watch_retry_interval_ms")]
    pub watch_retry_interval_ms: u64,

    #[serde(default = "ConfigDefaults::leader_election")]
    pub leader_election: LeaderElection,

    #[serde(default = "ConfigDefaults::leader_check_interval_secs")]
    pub leader_check_interval_secs: u64,

    #[serde(default = "ConfigDefaults::leader_lease_secs")]
    pub leader_lease_secs: u64,

    #[serde(default = "ConfigDefaults::pop_timeout_secs")]
    pub pop_timeout_secs: u64,

    #[serde(default = "ConfigDefaults::fused_event_expire_secs")]
    pub fused_event_expire_secs: u64,

    #[serde(default = "ConfigDefaults::default_callback_timeout_secs")]
    pub default_callback_timeout_secs: u64,

    #[serde(default = "ConfigDefaults::subscriber_cursor_ttl_secs")]
    pub subscriber_cursor_ttl_secs: u64,

    #[serde(default = "ConfigDefaults::clean_interval_secs")]
    pub clean_interval_secs: u64,

    #[serde(default = "ConfigDefaults::trim_threshold")]
    pub trim_threshold: usize,

    #[serde(default = "ConfigDefaults::delete_threshold")]
    pub delete_threshold: usize,

    #[serde(default = "ConfigDefaults::clean_unit")]
    pub clean_unit: usize,

    #[serde(default = "ConfigDefaults::reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Subscriptions registered when the daemon boots.
    #[serde(default)]
    pub subscriptions: Vec<Subscription>,
}

// # Accessors
impl Config {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn watch_retry_interval(&self) -> Duration {
        Duration::from_millis(self.watch_retry_interval_ms)
    }

    pub fn leader_check_interval(&self) -> Duration {
        Duration::from_secs(self.leader_check_interval_secs)
    }

    pub fn leader_lease(&self) -> Duration {
        Duration::from_secs(self.leader_lease_secs)
    }

    pub fn pop_timeout(&self) -> Duration {
        Duration::from_secs(self.pop_timeout_secs)
    }

    pub fn fused_event_expire(&self) -> Duration {
        Duration::from_secs(self.fused_event_expire_secs)
    }

    pub fn default_callback_timeout(&self) -> Duration {
        Duration::from_secs(self.default_callback_timeout_secs)
    }

    pub fn subscriber_cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.subscriber_cursor_ttl_secs)
    }

    pub fn clean_interval(&self) -> Duration {
        Duration::from_secs(self.clean_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn thresholds(&self) -> QueueThresholds {
        QueueThresholds {
            trim: self.trim_threshold,
            delete: self.delete_threshold,
            clean_unit: self.clean_unit,
        }
    }
}

// # Loading and verifying
impl Config {
    /// Creates the config at startup from the given file.
    ///
    /// Logging is initialized as soon as the file has been parsed so that
    /// verification problems end up in the configured log.
    pub fn create(config_file: &str) -> Result<Self, ConfigError> {
        let config = match Self::read_config(config_file) {
            Err(e) => {
                if config_file == EVENTD_DEFAULT_CONFIG_FILE {
                    Err(ConfigError::other(
                        "Cannot find config file. Please use --config to specify its location.",
                    ))
                }
                else {
                    Err(ConfigError::Other(format!(
                        "Error parsing config file: {config_file}, error: {e}"
                    )))
                }
            }
            Ok(config) => {
                config.init_logging()?;
                info!(
                    "{EVENTD_SERVER_APP} uses configuration file: {config_file}"
                );
                Ok(config)
            }
        }?;
        config.verify().map_err(|e| {
            ConfigError::Other(format!(
                "Error parsing config file: {config_file}, error: {e}"
            ))
        })?;
        Ok(config)
    }

    pub fn read_config(file: &str) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(file)?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(ConfigError::from)
    }

    pub fn verify(&self) -> Result<(), ConfigError> {
        if !KeyValueStore::supports_scheme(self.storage_uri.scheme()) {
            return Err(ConfigError::Other(format!(
                "storage_uri scheme '{}' is not supported by this build",
                self.storage_uri.scheme()
            )))
        }

        if self.key_prefix.is_empty() {
            return Err(ConfigError::other("key_prefix must not be empty"))
        }

        if self.watch_resources.is_empty() {
            return Err(ConfigError::other(
                "watch_resources must name at least one resource"
            ))
        }

        if self.watch_batch_size == 0 {
            return Err(ConfigError::other("watch_batch_size must be at least 1"))
        }

        if self.pop_timeout_secs == 0 {
            return Err(ConfigError::other("pop_timeout_secs must be at least 1"))
        }

        if self.default_callback_timeout_secs == 0 {
            return Err(ConfigError::other(
                "default_callback_timeout_secs must be at least 1"
            ))
        }

        if self.fused_event_expire_secs == 0 {
            return Err(ConfigError::other(
                "fused_event_expire_secs must be at least 1"
            ))
        }

        if self.clean_interval_secs == 0 || self.reconcile_interval_secs == 0 {
            return Err(ConfigError::other(
                "clean_interval_secs and reconcile_interval_secs must be at least 1"
            ))
        }

        if self.leader_election == LeaderElection::Lease
            && self.leader_lease_secs <= self.leader_check_interval_secs
        {
            return Err(ConfigError::other(
                "leader_lease_secs must be longer than leader_check_interval_secs"
            ))
        }

        if self.clean_unit == 0 {
            return Err(ConfigError::other("clean_unit must be at least 1"))
        }

        if self.trim_threshold >= self.delete_threshold {
            return Err(ConfigError::other(
                "trim_threshold must be smaller than delete_threshold"
            ))
        }

        if self.clean_unit > self.trim_threshold {
            return Err(ConfigError::other(
                "clean_unit must not exceed trim_threshold"
            ))
        }

        for sub in &self.subscriptions {
            sub.validate().map_err(|e| ConfigError::Other(e.to_string()))?;
        }

        Ok(())
    }
}

// # Logging
impl Config {
    pub fn init_logging(&self) -> Result<(), ConfigError> {
        match self.log_type {
            LogType::File => self.file_logger(&self.log_file),
            LogType::Stderr => self.stderr_logger(),
            #[cfg(unix)]
            LogType::Syslog => {
                let facility = syslog::Facility::from_str(
                    &self.syslog_facility
                ).map_err(|_| ConfigError::other("Invalid syslog_facility"))?;
                self.syslog_logger(facility)
            }
            #[cfg(not(unix))]
            LogType::Syslog => {
                Err(ConfigError::other("syslog is only supported on unix"))
            }
        }
    }

    /// Creates a stderr logger.
    fn stderr_logger(&self) -> Result<(), ConfigError> {
        self.fern_logger()
            .chain(io::stderr())
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!(
                    "Failed to init stderr logging: {e}"
                ))
            })
    }

    /// Creates a file logger using the file provided by `path`.
    fn file_logger(&self, path: &Path) -> Result<(), ConfigError> {
        let file = match fern::log_file(path) {
            Ok(file) => file,
            Err(err) => {
                let error_string = format!(
                    "Failed to open log file '{}': {}", path.display(), err
                );
                error!("{}", error_string.as_str());
                return Err(ConfigError::Other(error_string));
            }
        };
        self.fern_logger()
            .chain(file)
            .apply()
            .map_err(|e| {
                ConfigError::Other(format!("Failed to init file logging: {e}"))
            })
    }

    /// Creates a syslog logger and configures correctly.
    #[cfg(unix)]
    fn syslog_logger(
        &self, facility: syslog::Facility
    ) -> Result<(), ConfigError> {
        let process = env::current_exe()
            .ok()
            .and_then(|path| {
                path.file_name()
                    .and_then(std::ffi::OsStr::to_str)
                    .map(ToString::to_string)
            })
            .unwrap_or_else(|| String::from(EVENTD_SERVER_APP));
        let formatter = syslog::Formatter3164 {
            facility,
            hostname: None,
            process,
            pid: std::process::id(),
        };
        let logger = syslog::unix(formatter.clone())
            .or_else(|_| syslog::tcp(formatter.clone(), ("127.0.0.1", 601)))
            .or_else(|_| {
                syslog::udp(formatter, ("127.0.0.1", 0), ("127.0.0.1", 514))
            });
        match logger {
            Ok(logger) => self
                .fern_logger()
                .chain(logger)
                .apply()
                .map_err(|e| {
                    ConfigError::Other(format!("Failed to init syslog: {e}"))
                }),
            Err(err) => {
                let msg = format!("Cannot connect to syslog: {err}");
                Err(ConfigError::Other(msg))
            }
        }
    }

    /// Creates and returns a fern logger with log level tweaks
    fn fern_logger(&self) -> fern::Dispatch {
        // suppress overly noisy logging
        let framework_level = self.log_level.min(LevelFilter::Warn);

        let show_target = self.log_level == LevelFilter::Trace
            || self.log_level == LevelFilter::Debug;
        fern::Dispatch::new()
            .format(move |out, message, record| {
                if show_target {
                    out.finish(format_args!(
                        "{} [{}] [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        record.target(),
                        message
                    ))
                }
                else {
                    out.finish(format_args!(
                        "{} [{}] {}",
                        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                        record.level(),
                        message
                    ))
                }
            })
            .level(self.log_level)
            .level_for("hyper", framework_level)
            .level_for("hyper_util", framework_level)
            .level_for("mio", framework_level)
            .level_for("reqwest", framework_level)
            .level_for("want", framework_level)
            .level_for("h2", framework_level)
            .level_for("redis", framework_level)
    }
}

// # Testing
impl Config {
    /// Returns a config for tests with short timers.
    pub fn test(storage_uri: &Url) -> Self {
        let mut config = Self::parse("").expect("empty config is valid");
        config.storage_uri = storage_uri.clone();
        config.log_level = LevelFilter::Debug;
        config.log_type = LogType::Stderr;
        config.port = 0;
        config.watch_retry_interval_ms = 20;
        config.leader_check_interval_secs = 1;
        config.pop_timeout_secs = 1;
        config.default_callback_timeout_secs = 2;
        config.clean_interval_secs = 1;
        config.reconcile_interval_secs = 1;
        config
    }
}


//------------ QueueThresholds -----------------------------------------------

/// Size limits that keep the queues bounded.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct QueueThresholds {
    /// Above this length the oldest `clean_unit` entries are dropped.
    pub trim: usize,

    /// Above this length a queue is cleared entirely.
    pub delete: usize,

    pub clean_unit: usize,
}

impl Default for QueueThresholds {
    fn default() -> Self {
        QueueThresholds {
            trim: DEFAULT_TRIM_THRESHOLD,
            delete: DEFAULT_DELETE_THRESHOLD,
            clean_unit: DEFAULT_CLEAN_UNIT,
        }
    }
}


//------------ LogType -------------------------------------------------------

/// The target to log to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LogType {
    Stderr,
    File,
    Syslog,
}

impl FromStr for LogType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stderr" => Ok(LogType::Stderr),
            "file" => Ok(LogType::File),
            "syslog" => Ok(LogType::Syslog),
            _ => Err(format!(
                "expected \"stderr\", \"file\" or \"syslog\", found: \"{s}\""
            )),
        }
    }
}

impl<'de> Deserialize<'de> for LogType {
    fn deserialize<D>(d: D) -> Result<LogType, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        LogType::from_str(&string).map_err(de::Error::custom)
    }
}


//------------ LeaderElection ------------------------------------------------

/// How a replica decides that it may perform distribution work.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LeaderElection {
    /// This is the only replica, it always leads.
    Always,

    /// Replicas compete for a lease in the key-value store.
    Lease,
}

impl<'de> Deserialize<'de> for LeaderElection {
    fn deserialize<D>(d: D) -> Result<LeaderElection, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(d)?;
        match string.as_str() {
            "always" => Ok(LeaderElection::Always),
            "lease" => Ok(LeaderElection::Lease),
            _ => Err(de::Error::custom(format!(
                "expected \"always\" or \"lease\", found: \"{string}\""
            ))),
        }
    }
}

fn de_level_filter<'de, D>(d: D) -> Result<LevelFilter, D::Error>
where
    D: Deserializer<'de>,
{
    let string = String::deserialize(d)?;
    LevelFilter::from_str(&string).map_err(de::Error::custom)
}


//------------ ConfigError ---------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    TomlError(toml::de::Error),
    Other(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "{e}"),
            ConfigError::TomlError(e) => write!(f, "{e}"),
            ConfigError::Other(s) => f.write_str(s),
        }
    }
}

impl ConfigError {
    pub fn other(s: &str) -> ConfigError {
        ConfigError::Other(s.to_string())
    }
}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        ConfigError::IoError(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::TomlError(e)
    }
}


//------------ Tests ---------------------------------------------------------
