//! Scan command implementation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use ddsync_core::AllowList;

use super::RunningClient;
use crate::cli::OutputFormat;
use crate::config::Config;
use crate::format::{FormatOptions, format_scan_json, format_scan_text};
use crate::util::write_output;

/// List every dd-device heard during the scan window.
///
/// Runs the client with an empty allow-list so nothing is connected; paired
/// devices are flagged from the configuration instead.
pub async fn cmd_scan(
    timeout: u64,
    format: OutputFormat,
    output: Option<&PathBuf>,
    quiet: bool,
    opts: &FormatOptions,
    config: &Config,
) -> Result<()> {
    if !quiet && matches!(format, OutputFormat::Text) {
        eprintln!("Scanning for dd-devices ({}s)...", timeout);
    }

    let running = RunningClient::start(config.manager_config()?, AllowList::new()).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            if !quiet {
                eprintln!("\nScan interrupted.");
            }
        }
        _ = tokio::time::sleep(Duration::from_secs(timeout)) => {}
    }

    let mut peripherals = running
        .client
        .peripherals()
        .await
        .context("Failed to collect scan results")?;
    running.stop().await?;

    for p in &mut peripherals {
        p.paired = config.paired.contains(p.handle.as_str());
    }

    let content = match format {
        OutputFormat::Json => format_scan_json(&peripherals, opts)?,
        OutputFormat::Text => format_scan_text(&peripherals, opts),
    };
    write_output(output, &content)
}
