//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::runner::SimOptions;

/// Multi-DON peer transport simulator.
#[derive(Parser, Debug, Clone)]
#[command(name = "don-p2p-sim")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum Format {
    /// Human-readable table.
    #[default]
    Table,
    /// Full JSON report.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a scenario file.
    Run(RunArgs),

    /// Print the built-in example scenario as JSON.
    Example,
}

/// Arguments for `run`.
#[derive(clap::Args, Debug, Clone)]
pub struct RunArgs {
    /// Scenario file. Runs the built-in example if omitted.
    #[arg(env = "DON_P2P_SIM_SCENARIO")]
    pub scenario: Option<PathBuf>,

    /// Milliseconds all nodes get to connect their required links.
    #[arg(long, default_value_t = 2000)]
    pub converge_timeout_ms: u64,

    /// Milliseconds given to in-flight messages after the last send.
    #[arg(long, default_value_t = 200)]
    pub settle_ms: u64,

    /// Milliseconds between retries of links that are down.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_interval_ms: u64,

    /// Exit with failure if any node did not converge.
    #[arg(long)]
    pub strict: bool,
}

impl RunArgs {
    /// Timing options for the run.
    #[must_use]
    pub fn options(&self) -> SimOptions {
        SimOptions {
            converge_timeout: Duration::from_millis(self.converge_timeout_ms),
            settle: Duration::from_millis(self.settle_ms),
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms.max(1)),
        }
    }
}
