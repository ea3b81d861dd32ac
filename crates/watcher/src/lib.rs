//! Change detection and event coalescing for Vigil
//!
//! This crate turns raw platform notifications into a deduplicated stream
//! of semantic change events:
//! - Native (notify) and polling backends behind one `EventSource` trait
//! - Per-path sliding debounce bounded by a hard latency cap
//! - Rename pairing against an in-memory mirror of every watched tree
//! - Overflow and root-loss recovery by targeted rescan
//! - Bounded, drop-oldest fan-out to subscribers and alert channels
//!
//! Pipeline: Source → Normalizer → Coalescing Window → Tree Tracker → Dispatcher

pub mod coalesce;
pub mod debounce;
pub mod dispatch;
pub mod engine;
pub mod ignore;
pub mod normalize;
pub mod platform;
pub mod reconcile;
pub mod registry;
pub mod tracker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub use dispatch::{AlertChannel, Dispatcher, Subscription, SubscriptionId};
pub use engine::Watcher;
pub use registry::{TargetOptions, TargetStatus};
pub use vigil_core::{
    BackendKind, ChangeEvent, ChangeKind, FileState, Result, WatchError, WatchTarget, WatchTargetId,
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period that closes a path's burst (default: 300ms)
    pub debounce_interval: Duration,

    /// Longest a burst may stay open under sustained churn (default: 5s)
    pub debounce_hard_cap: Duration,

    /// Walk interval for roots observed by polling (default: 2s)
    pub polling_interval: Duration,

    /// Per-subscriber queue depth before drop-oldest applies (default: 1024)
    pub consumer_queue_capacity: usize,

    /// Raw hand-off depth between sources and the pipeline (default: 8192)
    ///
    /// A native source that finds this full raises its overflow flag.
    pub event_queue_capacity: usize,

    /// Hash file contents during scans (default: false)
    pub hash_contents: bool,

    /// Rescan attempts before a target is declared lost (default: 3)
    pub max_rescan_attempts: u8,

    /// How often sources are checked for overflow (default: 50ms)
    pub overflow_check_interval: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_millis(300),
            debounce_hard_cap: Duration::from_secs(5),
            polling_interval: Duration::from_secs(2),
            consumer_queue_capacity: 1024,
            event_queue_capacity: 8192,
            hash_contents: false,
            max_rescan_attempts: 3,
            overflow_check_interval: Duration::from_millis(50),
        }
    }
}

/// Pipeline counters
#[derive(Debug, Default)]
pub struct WatcherMetrics {
    raw_events: AtomicU64,
    filtered_events: AtomicU64,
    overflows: AtomicU64,
    recoveries: AtomicU64,
    recovered_events: AtomicU64,
    emitted_events: AtomicU64,
    renames_paired: AtomicU64,
    targets_lost: AtomicU64,
}

impl WatcherMetrics {
    pub fn record_raw(&self) {
        self.raw_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_filtered(&self) {
        self.filtered_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_overflow(&self) {
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recovery(&self, events: usize) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
        self.recovered_events.fetch_add(events as u64, Ordering::Relaxed);
    }

    pub fn record_emitted(&self, renamed: bool) {
        self.emitted_events.fetch_add(1, Ordering::Relaxed);
        if renamed {
            self.renames_paired.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_lost(&self) {
        self.targets_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            raw_events: self.raw_events.load(Ordering::Relaxed),
            filtered_events: self.filtered_events.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            recoveries: self.recoveries.load(Ordering::Relaxed),
            recovered_events: self.recovered_events.load(Ordering::Relaxed),
            emitted_events: self.emitted_events.load(Ordering::Relaxed),
            renames_paired: self.renames_paired.load(Ordering::Relaxed),
            targets_lost: self.targets_lost.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `WatcherMetrics`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub raw_events: u64,
    pub filtered_events: u64,
    pub overflows: u64,
    pub recoveries: u64,
    pub recovered_events: u64,
    pub emitted_events: u64,
    pub renames_paired: u64,
    pub targets_lost: u64,
}
