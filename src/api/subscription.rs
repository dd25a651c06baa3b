//! Subscriber registrations.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::commons::error::Error;
use crate::constants::DEFAULT_CONFIRM_STATUS;


//------------ SubscriptionId ------------------------------------------------

pub type SubscriptionId = i64;


//------------ ConfirmMode ---------------------------------------------------

/// How a subscriber's response is judged.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfirmMode {
    /// The status code, as a decimal string, must equal the pattern.
    #[default]
    HttpStatus,

    /// The response body must match the pattern as a regular expression.
    Regular,

    /// Any response is accepted.
    None,
}


//------------ Subscription --------------------------------------------------

/// A persisted subscriber registration.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,

    #[serde(default)]
    pub subscription_name: String,

    pub callback_url: String,

    #[serde(default)]
    pub confirm_mode: ConfirmMode,

    #[serde(default)]
    pub confirm_pattern: String,

    /// Callback timeout in seconds, zero means the default applies.
    #[serde(default, rename = "time_out")]
    pub timeout_secs: u64,

    /// Comma separated event keys, e.g. `hostcreate,hostdelete`.
    pub subscription_form: String,

    #[serde(default, rename = "bk_supplier_account")]
    pub owner_id: String,

    /// Payload fields the subscriber wants. Empty means all of them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
}

impl Subscription {
    /// Returns the set of event keys this subscription is interested in.
    pub fn event_keys(&self) -> BTreeSet<String> {
        split_form(&self.subscription_form)
    }

    pub fn field_set(&self) -> BTreeSet<String> {
        self.fields.iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        if self.timeout_secs == 0 {
            default
        }
        else {
            Duration::from_secs(self.timeout_secs)
        }
    }

    /// Applies the defaults of the administrative path.
    ///
    /// A status confirmation without a pattern expects `200`, blanks are
    /// removed from the subscription form.
    pub fn normalize(&mut self) {
        if self.confirm_mode == ConfirmMode::HttpStatus
            && self.confirm_pattern.trim().is_empty()
        {
            self.confirm_pattern = DEFAULT_CONFIRM_STATUS.to_string();
        }
        self.subscription_form = self.event_keys()
            .into_iter()
            .collect::<Vec<_>>()
            .join(",");
    }

    /// Checks that the subscription can actually be served.
    pub fn validate(&self) -> Result<(), Error> {
        if self.subscription_id <= 0 {
            return Err(Error::invalid_subscription(format!(
                "id must be positive, got {}", self.subscription_id
            )))
        }
        let url = Url::parse(&self.callback_url).map_err(|e| {
            Error::invalid_subscription(format!(
                "bad callback url '{}': {e}", self.callback_url
            ))
        })?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(Error::invalid_subscription(format!(
                "callback url must use http or https: {}", self.callback_url
            )))
        }
        if self.event_keys().is_empty() {
            return Err(Error::invalid_subscription(
                "subscription form is empty"
            ))
        }
        if self.confirm_mode == ConfirmMode::Regular {
            Regex::new(&self.confirm_pattern).map_err(|e| {
                Error::invalid_subscription(format!(
                    "bad confirm pattern '{}': {e}", self.confirm_pattern
                ))
            })?;
        }
        Ok(())
    }

    /// Judges a subscriber's response according to the confirm mode.
    pub fn confirm(&self, status: u16, body: &str) -> Result<(), ConfirmError> {
        match self.confirm_mode {
            ConfirmMode::HttpStatus => {
                if status.to_string() == self.confirm_pattern {
                    Ok(())
                }
                else {
                    Err(ConfirmError::Status {
                        expected: self.confirm_pattern.clone(),
                        received: status,
                    })
                }
            }
            ConfirmMode::Regular => {
                let pattern = Regex::new(&self.confirm_pattern).map_err(|e| {
                    ConfirmError::Pattern(e.to_string())
                })?;
                if pattern.is_match(body) {
                    Ok(())
                }
                else {
                    Err(ConfirmError::Body(truncate(body, 256)))
                }
            }
            ConfirmMode::None => Ok(()),
        }
    }
}

/// Splits a subscription form into its event keys.
pub fn split_form(form: &str) -> BTreeSet<String> {
    form.split(',')
        .map(|s| s.split_whitespace().collect::<String>())
        .filter(|s| !s.is_empty())
        .collect()
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}


//------------ ConfirmError --------------------------------------------------

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConfirmError {
    Status { expected: String, received: u16 },
    Body(String),
    Pattern(String),
}

impl fmt::Display for ConfirmError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfirmError::Status { expected, received } => write!(
                f, "not confirmed, expected status {expected}, got {received}"
            ),
            ConfirmError::Body(body) => write!(
                f, "not confirmed by regular pattern, received: {body}"
            ),
            ConfirmError::Pattern(e) => {
                write!(f, "cannot build confirm pattern: {e}")
            }
        }
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription(id: i64, form: &str) -> Subscription {
        Subscription {
            subscription_id: id,
            subscription_name: format!("sub-{id}"),
            callback_url: "http://127.0.0.1:9/callback".into(),
            confirm_mode: ConfirmMode::HttpStatus,
            confirm_pattern: "200".into(),
            timeout_secs: 0,
            subscription_form: form.into(),
            owner_id: "0".into(),
            fields: vec![],
        }
    }

    #[test]
    fn form_is_split_and_trimmed() {
        let sub = subscription(1, " hostcreate, hostdelete,,moduletransfer ");
        let keys: Vec<_> = sub.event_keys().into_iter().collect();
        assert_eq!(keys, vec!["hostcreate", "hostdelete", "moduletransfer"]);
    }

    #[test]
    fn confirm_by_status() {
        let sub = subscription(1, "hostcreate");
        assert!(sub.confirm(200, "").is_ok());
        assert_eq!(
            sub.confirm(500, "boom"),
            Err(ConfirmError::Status { expected: "200".into(), received: 500 })
        );
        assert!(sub.confirm(201, "").is_err());
    }

    #[test]
    fn confirm_by_body() {
        let mut sub = subscription(1, "hostcreate");
        sub.confirm_mode = ConfirmMode::Regular;
        sub.confirm_pattern = r#""result":\s*true"#.into();
        assert!(sub.confirm(500, r#"{"result": true}"#).is_ok());
        assert!(matches!(
            sub.confirm(200, r#"{"result": false}"#),
            Err(ConfirmError::Body(_))
        ));

        sub.confirm_pattern = "(".into();
        assert!(matches!(sub.confirm(200, ""), Err(ConfirmError::Pattern(_))));
        assert!(sub.validate().is_err());
    }

    #[test]
    fn confirm_none_accepts_anything() {
        let mut sub = subscription(1, "hostcreate");
        sub.confirm_mode = ConfirmMode::None;
        assert!(sub.confirm(503, "unavailable").is_ok());
    }

    #[test]
    fn normalize_applies_defaults() {
        let mut sub = subscription(1, "hostdelete , hostcreate");
        sub.confirm_pattern = String::new();
        sub.normalize();
        assert_eq!(sub.confirm_pattern, "200");
        assert_eq!(sub.subscription_form, "hostcreate,hostdelete");
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_input() {
        let mut sub = subscription(1, "hostcreate");
        sub.callback_url = "ftp://example.com/".into();
        assert!(sub.validate().is_err());

        let sub = subscription(1, " , ");
        assert!(sub.validate().is_err());

        let sub = subscription(0, "hostcreate");
        assert!(sub.validate().is_err());
    }

    #[test]
    fn timeout_falls_back_to_default() {
        let mut sub = subscription(1, "hostcreate");
        let default = Duration::from_secs(10);
        assert_eq!(sub.timeout(default), default);
        sub.timeout_secs = 3;
        assert_eq!(sub.timeout(default), Duration::from_secs(3));
    }

    #[test]
    fn parse_admin_json() {
        let sub: Subscription = serde_json::from_str(r#"{
            "subscription_id": 5,
            "callback_url": "http://localhost/cb",
            "confirm_mode": "httpstatus",
            "confirm_pattern": "200",
            "time_out": 15,
            "subscription_form": "hostcreate",
            "bk_supplier_account": "0"
        }"#).unwrap();
        assert_eq!(sub.timeout_secs, 15);
        assert_eq!(sub.owner_id, "0");
        assert!(sub.fields.is_empty());
    }
}
