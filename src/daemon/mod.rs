//! Running eventd as a daemon.

pub mod http;
pub mod start;
