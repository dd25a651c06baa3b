//! The admin HTTP interface.

pub mod dispatch;
pub mod request;
pub mod response;
pub mod server;
