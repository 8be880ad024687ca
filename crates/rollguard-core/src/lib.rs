pub mod config;

pub use config::{ConfigError, RollguardConfig, parse_duration};
