//! Command-line overrides for the configuration file.

use std::path::PathBuf;

use clap::Args;

use crate::{Config, FramingMode};

/// Options shared by every relay command.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Args, Debug, Default, Clone)]
pub struct CliArgs {
    /// IPv4 address to listen on or connect to.
    #[arg(long, global = true)]
    pub address: Option<String>,

    /// Port to listen on or connect to.
    #[arg(long, global = true, allow_negative_numbers = true)]
    pub port: Option<i64>,

    /// Wire framing; both sides must agree.
    #[arg(long, global = true, value_enum)]
    pub framing: Option<FramingMode>,

    /// Log level (error, warn, info, debug, trace) or a full filter string.
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref address) = args.address {
            self.network.address = address.clone();
        }
        if let Some(port) = args.port {
            self.network.port = port;
        }
        if let Some(framing) = args.framing {
            self.network.framing = framing;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
