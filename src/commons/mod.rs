//! Common types used by the various eventd components.
pub mod error;
pub mod httpclient;
pub mod metrics;
pub mod storage;

//------------ Response Aliases ----------------------------------------------

pub type EdEmptyResult = std::result::Result<(), self::error::Error>;
pub type EdResult<T> = std::result::Result<T, self::error::Error>;
