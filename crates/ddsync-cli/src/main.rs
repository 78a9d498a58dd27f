//! Command-line interface for dd-device peripherals.
//!
//! # Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `scan` | List nearby dd-devices |
//! | `pair` | Add a device to the paired list |
//! | `unpair` | Remove a device from the paired list |
//! | `sync` | Connect to paired devices and stream their records |
//! | `config` | Show the configuration file path or contents |
//!
//! # Configuration
//!
//! Settings live in `~/.config/ddsync/config.toml` (or the platform
//! equivalent, or `--config PATH`):
//!
//! - `name_prefix`: advertised-name prefix of dd-devices
//! - `read_timeout_secs`: per-record read timeout, 0 to wait forever
//! - `paired`: devices synced automatically
//! - `format`: default output format (`text` or `json`)

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;
mod config;
mod format;
mod util;

use cli::{Cli, Commands};
use commands::{SyncArgs, cmd_config, cmd_pair, cmd_scan, cmd_sync, cmd_unpair};
use config::{Config, resolve_format};
use format::FormatOptions;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Quiet mode still shows warnings.
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path);
    let opts = FormatOptions::new(cli.no_color, cli.compact);
    let output = cli.output.as_ref();

    match cli.command {
        Commands::Scan { timeout, format } => {
            let format = resolve_format(format, &config);
            cmd_scan(timeout, format, output, cli.quiet, &opts, &config).await?;
        }
        Commands::Pair { handle } => {
            cmd_pair(&handle, &mut config, &config_path, cli.quiet)?;
        }
        Commands::Unpair { handle } => {
            cmd_unpair(&handle, &mut config, &config_path, cli.quiet)?;
        }
        Commands::Sync {
            device,
            duration,
            poll_interval,
            format,
        } => {
            let args = SyncArgs {
                devices: device,
                duration,
                poll_interval,
                format: resolve_format(format, &config),
            };
            cmd_sync(args, output, cli.quiet, &opts, &config).await?;
        }
        Commands::Config { action } => {
            cmd_config(action, &config, &config_path)?;
        }
    }

    Ok(())
}
