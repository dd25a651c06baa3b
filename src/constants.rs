//! Various eventd-wide constants.

use std::time::Duration;


//------------ Binary Names -------------------------------------------------

/// The friendly name of the `eventd` binary.
pub const EVENTD_SERVER_APP: &str = "eventd";

/// The version of this crate, used in the user agent of callbacks.
pub const EVENTD_VERSION: &str = env!("CARGO_PKG_VERSION");


//------------ Config Files Paths -------------------------------------------

/// The default path to the eventd config file.
pub const EVENTD_DEFAULT_CONFIG_FILE: &str = "/etc/eventd.conf";


//------------ Environment Variables ----------------------------------------

/// The environment variable with the log level.
///
/// The variable should contain the name of a [`log::LevelFilter`]. It will
/// be overwritten by the config file. The default is “info.”
pub const EVENTD_ENV_LOG_LEVEL: &str = "EVENTD_LOG_LEVEL";

/// The environment variable with the log target.
///
/// The variable should contain the name of a
/// [`LogType`][crate::config::LogType]. It will be overwritten by the
/// config file. The default is “stderr.”
pub const EVENTD_ENV_LOG_TYPE: &str = "EVENTD_LOG_TYPE";

/// The environment variable indicating the default storage URI.
pub const EVENTD_ENV_STORAGE_URI: &str = "EVENTD_STORAGE_URI";


//------------ Key Layout ---------------------------------------------------

/// The default prefix for all keys in the key-value store.
pub const DEFAULT_KEY_PREFIX: &str = "cc:v3:";

/// The main queue that all translated events are pushed onto.
pub const MAIN_QUEUE: &str = "event:inst_queue";

/// The in-flight queue holding events popped but not yet fanned out.
pub const DUPLICATE_QUEUE: &str = "event:inst_queue_duplicate";

/// The diagnostics counter incremented for every ingested event.
pub const EVENT_ID_COUNTER: &str = "event:inst_id";

/// The leadership lease.
pub const LEADER_LEASE: &str = "event:leader";

/// Per subscriber delivery queue, suffixed with the subscription id.
pub const SUBSCRIBER_QUEUE: &str = "event:subscriber_queue:";

/// Per subscriber statistics hash, suffixed with the subscription id.
pub const SUBSCRIBER_STATS: &str = "event:callback_stats:";

/// Per subscriber distribution id counter.
pub const DISTRIBUTION_ID_COUNTER: &str = "event:dist_id:";

/// Per event key and subscriber resume cursor.
pub const SUBSCRIBER_CURSOR: &str = "event:subscriber_cursor:";

/// Per resource resume cursor of the change consumers.
pub const RESOURCE_CURSOR: &str = "event:resource_cursor:";

/// Field names in the statistics hash.
pub const STATS_FIELD_TOTAL: &str = "total";
pub const STATS_FIELD_FAILURE: &str = "failure";


//------------ Timing Defaults ----------------------------------------------

/// Events older than this are considered fused and are never delivered.
pub const DEFAULT_FUSED_EVENT_EXPIRE: Duration = Duration::from_secs(3 * 3600);

/// Callback timeout used when a subscription does not specify one.
pub const DEFAULT_CALLBACK_TIMEOUT_SECS: u64 = 10;

/// Lifetime of a subscriber resume cursor after a confirmed delivery.
pub const DEFAULT_SUBSCRIBER_CURSOR_TTL_SECS: u64 = 6 * 3600;

/// How long a blocking queue pop may wait before leadership is rechecked.
pub const DEFAULT_POP_TIMEOUT_SECS: u64 = 5;

/// How long a non-leader sleeps before checking leadership again.
pub const DEFAULT_LEADER_CHECK_INTERVAL_SECS: u64 = 3;

/// Back-off for transient change source errors.
pub const DEFAULT_WATCH_RETRY_INTERVAL_MS: u64 = 500;

/// Maximum number of change records read per batch.
pub const DEFAULT_WATCH_BATCH_SIZE: usize = 100;

/// Interval between two housekeeping passes.
pub const DEFAULT_CLEAN_INTERVAL_SECS: u64 = 60;

/// Interval between two pusher reconciliation passes.
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Lifetime of the leadership lease if it is not renewed.
pub const DEFAULT_LEADER_LEASE_SECS: u64 = 15;


//------------ Housekeeping Thresholds --------------------------------------

/// Queues longer than this lose their oldest `clean_unit` entries.
pub const DEFAULT_TRIM_THRESHOLD: usize = 20_000;

/// Queues longer than this are cleared entirely.
pub const DEFAULT_DELETE_THRESHOLD: usize = 50_000;

/// Number of entries removed by a single trim.
pub const DEFAULT_CLEAN_UNIT: usize = 10_000;


//------------ HTTP ---------------------------------------------------------

/// The default confirm pattern of the status code confirm mode.
pub const DEFAULT_CONFIRM_STATUS: &str = "200";

/// Maximum size of a POST body accepted by the admin API.
pub const HTTP_POST_LIMIT_API: u64 = 256 * 1024;

/// Maximum part of a subscriber's response body read for confirmation.
pub const CALLBACK_RESPONSE_LIMIT: usize = 64 * 1024;
