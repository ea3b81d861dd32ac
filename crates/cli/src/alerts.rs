//! Built-in alert channels

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, Utc};
use owo_colors::OwoColorize;
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;
use vigil_watcher::{AlertChannel, ChangeEvent, ChangeKind};

/// Colored one-line summaries on stdout
#[derive(Default)]
pub struct ConsoleChannel {
    seen_dropped: AtomicU64,
}

impl ConsoleChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AlertChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn deliver(&self, event: &ChangeEvent, dropped: u64) -> Result<()> {
        let previous = self.seen_dropped.swap(dropped, Ordering::Relaxed);
        if dropped > previous {
            println!("{}", format!("  ... {} events dropped", dropped - previous).dimmed());
        }
        println!("{}", console_line(event));
        Ok(())
    }
}

pub fn console_line(event: &ChangeEvent) -> String {
    let time = DateTime::<Local>::from(event.occurred_at).format("%H:%M:%S%.3f");
    let label = format!("{:<10}", event.kind.label());
    let label = match &event.kind {
        ChangeKind::Created => label.green().to_string(),
        ChangeKind::Modified => label.yellow().to_string(),
        ChangeKind::Deleted => label.red().to_string(),
        ChangeKind::Renamed { .. } => label.cyan().to_string(),
        ChangeKind::AttributesChanged => label.magenta().to_string(),
    };
    let subject = match &event.kind {
        ChangeKind::Renamed { from, to } => format!("{} -> {}", from.display(), to.display()),
        _ => event.path.display().to_string(),
    };
    format!("{} {} {}", time.dimmed(), label, subject)
}

/// One JSON object per line
pub struct JsonChannel {
    out: Mutex<Box<dyn Write + Send>>,
}

impl JsonChannel {
    pub fn stdout() -> Self {
        Self::with_writer(Box::new(io::stdout()))
    }

    pub fn with_writer(out: Box<dyn Write + Send>) -> Self {
        Self { out: Mutex::new(out) }
    }
}

#[derive(Debug, Serialize)]
pub struct JsonRecord<'a> {
    pub time: String,
    pub kind: &'static str,
    pub path: &'a std::path::Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<&'a std::path::Path>,
    pub target: u64,
    pub dropped: u64,
}

impl<'a> JsonRecord<'a> {
    pub fn new(event: &'a ChangeEvent, dropped: u64) -> Self {
        let from = match &event.kind {
            ChangeKind::Renamed { from, .. } => Some(from.as_path()),
            _ => None,
        };
        Self {
            time: DateTime::<Utc>::from(event.occurred_at).to_rfc3339_opts(SecondsFormat::Millis, true),
            kind: event.kind.label(),
            path: &event.path,
            from,
            target: event.target.get(),
            dropped,
        }
    }
}

#[async_trait]
impl AlertChannel for JsonChannel {
    fn name(&self) -> &str {
        "json"
    }

    async fn deliver(&self, event: &ChangeEvent, dropped: u64) -> Result<()> {
        let line = serde_json::to_string(&JsonRecord::new(event, dropped)).context("Failed to encode event")?;
        let mut out = self.out.lock();
        writeln!(out, "{line}").context("Failed to write event")?;
        out.flush().context("Failed to flush event")?;
        Ok(())
    }
}

/// Events as structured `tracing` records
pub struct LogChannel;

#[async_trait]
impl AlertChannel for LogChannel {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, event: &ChangeEvent, dropped: u64) -> Result<()> {
        info!(
            target: "vigil::events",
            watch = %event.target,
            kind = event.kind.label(),
            dropped,
            "{}",
            event
        );
        Ok(())
    }
}
