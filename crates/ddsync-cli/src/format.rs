//! Output formatting utilities for text and JSON output.

use anyhow::Result;
use ddsync_core::{LinkState, PeripheralSummary, SyncEvent, SyncedBatch};
use owo_colors::OwoColorize;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Formatting options for output.
#[derive(Debug, Clone, Copy, Default)]
pub struct FormatOptions {
    /// Disable colored output.
    pub no_color: bool,
    /// Use compact JSON output (no pretty-printing).
    pub compact: bool,
}

impl FormatOptions {
    pub fn new(no_color: bool, compact: bool) -> Self {
        Self { no_color, compact }
    }

    /// Serialize a value, honoring the compact setting.
    pub fn as_json<T: Serialize>(&self, value: &T) -> Result<String> {
        let json = if self.compact {
            serde_json::to_string(value)?
        } else {
            serde_json::to_string_pretty(value)?
        };
        Ok(json + "\n")
    }
}

fn format_time(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

fn link_label(link: LinkState, ready: bool, no_color: bool) -> String {
    let label = match (link, ready) {
        (LinkState::Connected, true) => "ready",
        (LinkState::Connected, false) => "connected",
        (LinkState::Connecting, _) => "connecting",
        (LinkState::Disconnected, _) => "seen",
    };
    if no_color {
        return label.to_string();
    }
    match (link, ready) {
        (LinkState::Connected, true) => label.green().to_string(),
        (LinkState::Disconnected, _) => label.dimmed().to_string(),
        _ => label.yellow().to_string(),
    }
}

/// Format scan results as a table.
#[must_use]
pub fn format_scan_text(peripherals: &[PeripheralSummary], opts: &FormatOptions) -> String {
    if peripherals.is_empty() {
        return "No dd-devices found.\n".to_string();
    }

    let mut out = if opts.no_color {
        format!("Found {} device(s):\n\n", peripherals.len())
    } else {
        format!(
            "Found {} device(s):\n\n",
            peripherals.len().to_string().green().bold()
        )
    };
    let name_width = peripherals
        .iter()
        .map(|p| p.name.len())
        .max()
        .unwrap_or(0)
        .max(4);
    let handle_width = peripherals
        .iter()
        .map(|p| p.handle.as_str().len())
        .max()
        .unwrap_or(0)
        .max(6);

    out.push_str(&format!(
        "{:<name_width$}  {:<handle_width$}  {:>5}  {:<6}  STATE\n",
        "NAME", "HANDLE", "RSSI", "PAIRED"
    ));
    for p in peripherals {
        let rssi = p
            .rssi
            .map(|r| r.to_string())
            .unwrap_or_else(|| "-".to_string());
        out.push_str(&format!(
            "{:<name_width$}  {:<handle_width$}  {:>5}  {:<6}  {}\n",
            p.name,
            p.handle.as_str(),
            rssi,
            if p.paired { "yes" } else { "no" },
            link_label(p.link, p.ready, opts.no_color),
        ));
    }
    out
}

/// Format scan results as JSON.
pub fn format_scan_json(peripherals: &[PeripheralSummary], opts: &FormatOptions) -> Result<String> {
    #[derive(Serialize)]
    struct ScanResult<'a> {
        count: usize,
        devices: &'a [PeripheralSummary],
    }

    opts.as_json(&ScanResult {
        count: peripherals.len(),
        devices: peripherals,
    })
}

/// Format a synced batch as human-readable lines, one per record.
#[must_use]
pub fn format_batch_text(batch: &SyncedBatch, opts: &FormatOptions) -> String {
    let handle = if opts.no_color {
        batch.handle().to_string()
    } else {
        batch.handle().cyan().to_string()
    };
    let mut out = format!("{} {} from {}\n", batch.len(), batch.kind(), handle);
    match batch {
        SyncedBatch::Readings { records, .. } => {
            for r in records {
                out.push_str(&format!(
                    "  {}  {}  {:>6.1} °C  {:>5.1} %\n",
                    format_time(r.timestamp),
                    r.record_id,
                    r.temperature,
                    r.humidity
                ));
            }
        }
        SyncedBatch::Events { records, .. } => {
            for e in records {
                let kind = e
                    .kind()
                    .map(|k| format!("{:?}", k).to_lowercase())
                    .unwrap_or_else(|| format!("type {}", e.event_type));
                out.push_str(&format!(
                    "  {}  {}  {}\n",
                    format_time(e.timestamp),
                    e.record_id,
                    kind
                ));
            }
        }
    }
    out
}

/// Format a synced batch as JSON.
pub fn format_batch_json(batch: &SyncedBatch, opts: &FormatOptions) -> Result<String> {
    opts.as_json(batch)
}

/// One-line progress message for a lifecycle event.
///
/// Returns `None` for events not worth showing.
#[must_use]
pub fn format_event_line(event: &SyncEvent, opts: &FormatOptions) -> Option<String> {
    let line = match event {
        SyncEvent::Discovered { .. } => return None,
        SyncEvent::Connected { handle } => format!("Connected to {}", handle),
        SyncEvent::Ready { handle } => format!("{} is ready", handle),
        SyncEvent::Disconnected {
            handle,
            error: Some(error),
        } => format!("Lost connection to {}: {}", handle, error),
        SyncEvent::Disconnected { handle, error: None } => format!("Disconnected from {}", handle),
        SyncEvent::SyncStarted { handle, kind } => format!("Syncing {} from {}", kind, handle),
        SyncEvent::SyncCompleted {
            handle,
            kind,
            records,
        } => format!("Synced {} {} from {}", records, kind, handle),
        SyncEvent::SyncAborted {
            handle,
            kind,
            reason,
        } => {
            let line = format!("Sync of {} from {} aborted: {}", kind, handle, reason);
            if opts.no_color {
                line
            } else {
                line.red().to_string()
            }
        }
        _ => return None,
    };
    Some(line)
}
