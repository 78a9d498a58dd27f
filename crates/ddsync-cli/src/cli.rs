//! CLI argument definitions using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

/// Output format for commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser)]
#[command(name = "ddsync")]
#[command(author, version, about = "Sync records from dd-device peripherals over BLE", long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress non-essential output
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Output compact JSON (no pretty-printing)
    #[arg(long, global = true)]
    pub compact: bool,

    /// Disable colored output
    #[arg(long, global = true, env = "NO_COLOR")]
    pub no_color: bool,

    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, global = true, env = "DDSYNC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Write output to file instead of stdout
    #[arg(short, long, global = true)]
    pub output: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Scan for nearby dd-devices
    Scan {
        /// Scan timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,

        /// Output format (defaults to the configured format)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Allow a device to be connected and synced automatically
    Pair {
        /// Device handle (MAC address or UUID)
        handle: String,
    },

    /// Remove a device from the paired list
    Unpair {
        /// Device handle (MAC address or UUID)
        handle: String,
    },

    /// Connect to paired devices and pull their queued records
    Sync {
        /// Additional device handle(s) - can be specified multiple times, or comma-separated
        #[arg(short, long, value_delimiter = ',', env = "DDSYNC_DEVICE")]
        device: Vec<String>,

        /// Stop after this many seconds (runs until Ctrl+C when omitted)
        #[arg(long)]
        duration: Option<u64>,

        /// Also pull readings from ready devices every N seconds
        #[arg(long, value_parser = parse_poll_interval)]
        poll_interval: Option<u64>,

        /// Output format (defaults to the configured format)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration subcommands
#[derive(Debug, Clone, Copy, Subcommand)]
pub enum ConfigAction {
    /// Show configuration file path
    Path,

    /// Show current configuration
    Show,
}

fn parse_poll_interval(s: &str) -> Result<u64, String> {
    let secs: u64 = s
        .parse()
        .map_err(|_| format!("Invalid poll interval '{}'. Must be a number of seconds.", s))?;
    if secs == 0 {
        return Err("Poll interval must be at least 1 second".to_string());
    }
    Ok(secs)
}
