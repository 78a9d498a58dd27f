//! Sync command - connect to paired devices and stream their records.

use std::future::pending;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use ddsync_core::{SyncEvent, SyncedBatch};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{MissedTickBehavior, interval, sleep};
use tracing::{debug, warn};

use super::RunningClient;
use crate::cli::OutputFormat;
use crate::config::Config;
use crate::format::{FormatOptions, format_batch_json, format_batch_text, format_event_line};
use crate::util::append_output;

/// Arguments for the sync command.
pub struct SyncArgs {
    pub devices: Vec<String>,
    pub duration: Option<u64>,
    pub poll_interval: Option<u64>,
    pub format: OutputFormat,
}

/// Running totals printed when the command stops.
#[derive(Debug, Default, PartialEq, Eq)]
struct SyncTotals {
    readings: usize,
    events: usize,
    aborted: usize,
}

impl SyncTotals {
    fn record(&mut self, batch: &SyncedBatch) {
        match batch {
            SyncedBatch::Readings { records, .. } => self.readings += records.len(),
            SyncedBatch::Events { records, .. } => self.events += records.len(),
        }
    }

    fn summary(&self) -> String {
        let mut line = format!(
            "Synced {} reading(s) and {} event(s)",
            self.readings, self.events
        );
        if self.aborted > 0 {
            line.push_str(&format!(", {} batch(es) aborted", self.aborted));
        }
        line
    }
}

/// Execute the sync command.
///
/// Readings and events are pulled whenever a paired device becomes ready;
/// further events arrive through the device's notifications.
pub async fn cmd_sync(
    args: SyncArgs,
    output: Option<&PathBuf>,
    quiet: bool,
    opts: &FormatOptions,
    config: &Config,
) -> Result<()> {
    let allow_list = config.allow_list(&args.devices);
    if allow_list.is_empty() {
        bail!(
            "No paired devices. Use 'ddsync pair <HANDLE>' or pass --device <HANDLE>.\n\
             Run 'ddsync scan' to find nearby devices."
        );
    }
    let paired = allow_list.len();

    let mut running = RunningClient::start(config.manager_config()?, allow_list).await?;
    let mut events = running.client.subscribe();

    if !quiet {
        match args.duration {
            Some(secs) => eprintln!("Waiting for {} paired device(s) for {}s", paired, secs),
            None => eprintln!(
                "Waiting for {} paired device(s) | Press Ctrl+C to stop",
                paired
            ),
        }
    }

    let deadline = async {
        match args.duration {
            Some(secs) => sleep(Duration::from_secs(secs)).await,
            None => pending().await,
        }
    };
    tokio::pin!(deadline);

    let mut poll = args.poll_interval.map(|secs| {
        let mut poll = interval(Duration::from_secs(secs));
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        poll
    });

    let mut totals = SyncTotals::default();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if !quiet {
                    eprintln!("\nShutting down...");
                }
                break;
            }
            _ = &mut deadline => {
                debug!("Sync duration elapsed");
                break;
            }
            _ = async {
                match poll.as_mut() {
                    Some(poll) => {
                        poll.tick().await;
                    }
                    None => pending().await,
                }
            } => {
                for p in running.client.peripherals().await? {
                    if p.ready {
                        running.client.sync_readings(p.handle).await?;
                    }
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    match &event {
                        SyncEvent::Ready { handle } => {
                            running.client.sync_readings(handle.clone()).await?;
                            running.client.sync_events(handle.clone()).await?;
                        }
                        SyncEvent::SyncAborted { .. } => totals.aborted += 1,
                        _ => {}
                    }
                    if !quiet && let Some(line) = format_event_line(&event, opts) {
                        eprintln!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Missed lifecycle events");
                }
                Err(RecvError::Closed) => break,
            },
            batch = running.batches.recv() => match batch {
                Some(batch) => {
                    totals.record(&batch);
                    let content = match args.format {
                        OutputFormat::Json => format_batch_json(&batch, opts)?,
                        OutputFormat::Text => format_batch_text(&batch, opts),
                    };
                    append_output(output, &content)?;
                }
                None => break,
            },
        }
    }

    running.stop().await?;
    if !quiet {
        eprintln!("{}", totals.summary());
    }
    Ok(())
}
