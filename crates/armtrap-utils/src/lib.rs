//! # armtrap Utilities
//!
//! Logging setup and environment-driven configuration shared by the
//! armtrap binary and anything else that embeds the trap engine.

pub mod config;
pub mod logging;

pub use config::{parse_address, ConfigError, EnvOverrides};
pub use logging::{init_logging, LogFormat, LogLevel, LogSettings, LoggingError};
