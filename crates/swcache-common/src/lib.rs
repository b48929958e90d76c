//! # swcache Common
//!
//! Logging configuration and small shared helpers for the swcache crates.

pub mod logging;
pub mod time;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use time::unix_millis;
