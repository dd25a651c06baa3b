//! Defines all eventd server side errors

use std::{fmt, io};

use hyper::StatusCode;
use serde::{Deserialize, Serialize};

use crate::commons::httpclient;
use crate::commons::storage::KeyValueError;
use crate::config::ConfigError;
use crate::server::source::SourceError;


//------------ Error ---------------------------------------------------------

#[derive(Debug)]
pub enum Error {
    //-----------------------------------------------------------------
    // System Issues
    //-----------------------------------------------------------------
    IoError(io::Error),
    StorageError(KeyValueError),
    ConfigError(ConfigError),
    HttpClientError(httpclient::Error),
    SourceError(SourceError),

    //-----------------------------------------------------------------
    // Data Issues
    //-----------------------------------------------------------------
    JsonError(serde_json::Error),
    InvalidCursor(String),
    InvalidSubscription(String),
    UnknownResource(String),

    //-----------------------------------------------------------------
    // API Issues
    //-----------------------------------------------------------------
    ApiUnknownMethod,
    ApiUnknownResource,
    ApiInvalidId(String),
    ApiNotSupported(&'static str),
    PostTooBig,
    PostCannotRead,
    SubscriptionUnknown(i64),

    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(e) => write!(f, "I/O error: {e}"),
            Error::StorageError(e) => write!(f, "Storage error: {e}"),
            Error::ConfigError(e) => write!(f, "Configuration error: {e}"),
            Error::HttpClientError(e) => write!(f, "{e}"),
            Error::SourceError(e) => write!(f, "Change source error: {e}"),
            Error::JsonError(e) => write!(f, "Invalid JSON: {e}"),
            Error::InvalidCursor(s) => write!(f, "Invalid cursor: {s}"),
            Error::InvalidSubscription(s) => {
                write!(f, "Invalid subscription: {s}")
            }
            Error::UnknownResource(s) => {
                write!(f, "Unknown resource type: {s}")
            }
            Error::ApiUnknownMethod => write!(f, "Unknown API method"),
            Error::ApiUnknownResource => write!(f, "Unknown resource"),
            Error::ApiInvalidId(s) => write!(f, "Invalid id: {s}"),
            Error::ApiNotSupported(s) => write!(f, "Not supported: {s}"),
            Error::PostTooBig => write!(f, "POST body exceeds limit"),
            Error::PostCannotRead => write!(f, "Cannot read POST body"),
            Error::SubscriptionUnknown(id) => {
                write!(f, "Unknown subscription: {id}")
            }
            Error::Custom(s) => f.write_str(s),
        }
    }
}

impl std::error::Error for Error { }

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e)
    }
}

impl From<KeyValueError> for Error {
    fn from(e: KeyValueError) -> Self {
        Error::StorageError(e)
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Error::ConfigError(e)
    }
}

impl From<httpclient::Error> for Error {
    fn from(e: httpclient::Error) -> Self {
        Error::HttpClientError(e)
    }
}

impl From<SourceError> for Error {
    fn from(e: SourceError) -> Self {
        Error::SourceError(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::JsonError(e)
    }
}

impl Error {
    pub fn custom(msg: impl fmt::Display) -> Self {
        Error::Custom(msg.to_string())
    }

    pub fn invalid_subscription(msg: impl fmt::Display) -> Self {
        Error::InvalidSubscription(msg.to_string())
    }

    /// Returns the HTTP status used when this error ends up on the API.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::JsonError(_)
            | Error::InvalidCursor(_)
            | Error::InvalidSubscription(_)
            | Error::UnknownResource(_)
            | Error::ApiInvalidId(_)
            | Error::PostCannotRead => StatusCode::BAD_REQUEST,
            Error::PostTooBig => StatusCode::PAYLOAD_TOO_LARGE,
            Error::ApiUnknownMethod => StatusCode::METHOD_NOT_ALLOWED,
            Error::ApiUnknownResource
            | Error::SubscriptionUnknown(_) => StatusCode::NOT_FOUND,
            Error::ApiNotSupported(_) => StatusCode::NOT_IMPLEMENTED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        let label = match self {
            Error::IoError(_) => "sys-io",
            Error::StorageError(_) => "sys-storage",
            Error::ConfigError(_) => "sys-config",
            Error::HttpClientError(_) => "sys-http-client",
            Error::SourceError(_) => "sys-source",
            Error::JsonError(_) => "api-json",
            Error::InvalidCursor(_) => "api-invalid-cursor",
            Error::InvalidSubscription(_) => "api-invalid-subscription",
            Error::UnknownResource(_) => "api-unknown-resource-type",
            Error::ApiUnknownMethod => "api-unknown-method",
            Error::ApiUnknownResource => "api-unknown-resource",
            Error::ApiInvalidId(_) => "api-invalid-id",
            Error::ApiNotSupported(_) => "api-not-supported",
            Error::PostTooBig => "api-post-body-exceeds-limit",
            Error::PostCannotRead => "api-post-body-cannot-read",
            Error::SubscriptionUnknown(_) => "api-unknown-subscription",
            Error::Custom(_) => "general-error",
        };
        ErrorResponse::new(label, self)
    }
}


//------------ ErrorResponse -------------------------------------------------

/// The JSON body of an error returned by the admin API.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ErrorResponse {
    label: String,
    msg: String,
}

impl ErrorResponse {
    pub fn new(label: &str, msg: impl fmt::Display) -> Self {
        ErrorResponse { label: label.to_string(), msg: msg.to_string() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for ErrorResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.label, self.msg)
    }
}


//------------ Tests ---------------------------------------------------------
