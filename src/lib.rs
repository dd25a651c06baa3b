//! The _eventd_ library crate.

pub mod api;
pub mod commons;
pub mod config;
pub mod constants;
pub mod daemon;
pub mod server;
pub mod test;
