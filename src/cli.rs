//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Fleet controller
#[derive(Parser, Debug)]
#[command(name = "fleet")]
#[command(version)]
#[command(about = "Supervises a fleet of bot-connector worker processes")]
#[command(
    long_about = "Keeps one worker process per active bot, converges the fleet towards the control plane's desired state, repairs drift between bookkeeping and the OS process table, and serves an HTTP control surface with webhook ingress."
)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, global = true, env = "FLEET_CONFIG", default_value = "fleet.toml")]
    pub config: PathBuf,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the controller and its HTTP control surface
    Run {
        /// Address to bind, overriding the config file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Load, validate and print the effective configuration with secrets redacted
    CheckConfig,

    /// List tagged worker processes found in the process table
    Scan,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}
