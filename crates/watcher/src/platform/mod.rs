//! Platform event sources
//!
//! Provides a unified interface (`EventSource`) over the native notify
//! backend and the stat-and-diff polling fallback. The backend is chosen
//! once per root when its source starts: native first, polling when the
//! native backend refuses the root.

pub mod native;
pub mod polling;

use crate::ignore::ExcludeRules;
use crate::WatcherConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::warn;
use vigil_core::{BackendKind, Result, Snapshot, WatchTarget, WatchTargetId};

pub use native::NativeSource;
pub use polling::PollingSource;

/// Backend-specific action carried by a raw event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawAction {
    /// Notification from the native backend, as notify reported it
    Native(notify::EventKind),

    /// Delta found by a polling walk
    Polled(PollDelta),

    /// Events under `path` were lost; the subtree needs a rescan
    Overflow,

    /// The root itself went away
    RootLost,
}

/// What a polling walk saw change between two cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDelta {
    Appeared,
    Vanished,
    Changed,
    AttributesChanged,
}

/// Raw change notification, before normalization
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub target: WatchTargetId,
    pub path: PathBuf,
    pub backend: BackendKind,
    pub action: RawAction,
    /// Links both halves of a native rename when the backend provides it
    pub cookie: Option<usize>,
    pub observed_at: SystemTime,
}

impl RawEvent {
    pub fn new(target: WatchTargetId, path: PathBuf, backend: BackendKind, action: RawAction) -> Self {
        Self {
            target,
            path,
            backend,
            action,
            cookie: None,
            observed_at: SystemTime::now(),
        }
    }

    pub fn with_cookie(mut self, cookie: Option<usize>) -> Self {
        self.cookie = cookie;
        self
    }
}

/// Sending half every source writes raw events into
pub type RawSender = crossbeam_channel::Sender<RawEvent>;

/// Source statistics
#[derive(Debug, Clone, Default)]
pub struct SourceDiagnostics {
    /// Raw events handed to the pipeline
    pub events_sent: u64,

    /// Times the source lost events
    pub overflow_count: u64,

    /// Directories with an active subscription (native) or 1 (polling)
    pub watched_dirs: usize,

    /// Backend-specific detail
    pub platform_info: String,
}

#[derive(Debug, Default)]
pub(crate) struct SourceStats {
    pub sent: AtomicU64,
    pub overflows: AtomicU64,
}

impl SourceStats {
    pub fn sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn overflowed(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running producer of raw events for one watch target
pub trait EventSource: Send {
    fn kind(&self) -> BackendKind;

    /// Whether new subdirectories are observed without `watch_dir`
    fn recurses_natively(&self) -> bool;

    /// Subscribe one more directory
    fn watch_dir(&mut self, dir: &Path) -> Result<()>;

    /// Drop a directory subscription
    fn unwatch_dir(&mut self, dir: &Path);

    /// Read and reset the overflow flag
    fn take_overflow(&self) -> bool;

    /// Stop producing events; idempotent
    fn stop(&mut self);

    fn is_running(&self) -> bool;

    fn diagnostics(&self) -> SourceDiagnostics;
}

/// Start the best available source for `target`
///
/// `dirs` are the directories to subscribe natively; `seed` is the state the
/// polling fallback diffs its first walk against.
pub fn start_source(
    target: &WatchTarget,
    dirs: &[PathBuf],
    seed: Snapshot,
    rules: Arc<ExcludeRules>,
    config: &WatcherConfig,
    tx: RawSender,
) -> Result<Box<dyn EventSource>> {
    match NativeSource::start(target, dirs, tx.clone()) {
        Ok(source) => Ok(Box::new(source)),
        Err(err) => {
            warn!(
                target = %target.id,
                root = %target.root.display(),
                "native watching unavailable ({err}); falling back to polling every {:?}",
                config.polling_interval
            );
            Ok(Box::new(PollingSource::start(target, seed, rules, config, tx)?))
        }
    }
}
