//! CLI command definitions for the `swbd` binary.

pub mod config;
pub mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Drive and inspect a Switchboard event bus.
#[derive(Parser)]
#[command(name = "swbd", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry to stdout.
    #[arg(long, global = true)]
    pub otel: bool,

    /// Config file (defaults to ~/.switchboard/config.toml).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run echo agents over an in-memory bus and report metrics.
    #[command(alias = "sim")]
    Simulate {
        /// Number of echo agents to register.
        #[arg(short, long, default_value_t = 3)]
        agents: usize,

        /// Number of point-to-point messages to send.
        #[arg(short, long, default_value_t = 10)]
        messages: usize,

        /// Broadcast once from the first agent after the point-to-point run.
        #[arg(long)]
        broadcast: bool,

        /// Make every Nth delivery fail to exercise retry and dead letters.
        #[arg(long)]
        fail_every: Option<usize>,
    },

    /// Show configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML.
    Show,

    /// Print the resolved config file path.
    Path,
}
