//! Configuration for the relay messaging tools.
//!
//! Settings persist to disk as a RON file, can be overridden from the command
//! line, and tolerate missing or unknown fields so older and newer files load.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, FramingMode, NetworkConfig};
pub use error::ConfigError;
