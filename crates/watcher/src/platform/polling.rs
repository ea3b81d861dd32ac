//! Stat-and-diff polling backend
//!
//! Used for roots the native backend refuses (network mounts, exhausted
//! watch limits). Each cycle walks the subtree, diffs the walk against the
//! previous one, and sends one raw event per difference. The first cycle
//! diffs against a seed taken from the tree mirror, so nothing that happened
//! between registration and the first walk is missed.

use super::{EventSource, PollDelta, RawAction, RawEvent, RawSender, SourceDiagnostics, SourceStats};
use crate::ignore::ExcludeRules;
use crate::reconcile;
use crate::WatcherConfig;
use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use vigil_core::{BackendKind, Result, Snapshot, TreeDiff, WatchError, WatchTarget, WatchTargetId};

pub struct PollingSource {
    target: WatchTargetId,
    interval: Duration,
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
    stats: Arc<SourceStats>,
}

impl PollingSource {
    pub fn start(
        target: &WatchTarget,
        seed: Snapshot,
        rules: Arc<ExcludeRules>,
        config: &WatcherConfig,
        tx: RawSender,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let stats = Arc::new(SourceStats::default());
        let interval = config.polling_interval;
        let mut poller = Poller {
            target: target.id,
            root: target.root.clone(),
            recursive: target.recursive,
            rules,
            hash_contents: config.hash_contents,
            last: seed,
            tx,
            stop_rx,
            stats: stats.clone(),
        };

        let handle = thread::Builder::new()
            .name(format!("vigil-poll-{}", target.id.get()))
            .spawn(move || poller.run(interval))?;

        info!(
            target = %target.id,
            "polling {} every {:?}",
            target.root.display(),
            interval
        );

        Ok(Self {
            target: target.id,
            interval,
            stop_tx: Some(stop_tx),
            handle: Some(handle),
            stats,
        })
    }
}

impl EventSource for PollingSource {
    fn kind(&self) -> BackendKind {
        BackendKind::Polling
    }

    fn recurses_natively(&self) -> bool {
        true
    }

    fn watch_dir(&mut self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    fn unwatch_dir(&mut self, _dir: &Path) {}

    fn take_overflow(&self) -> bool {
        false
    }

    fn stop(&mut self) {
        // Dropping the sender wakes the poller out of its wait
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(target = %self.target, "poller thread panicked");
            }
            debug!(target = %self.target, "polling source stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    fn diagnostics(&self) -> SourceDiagnostics {
        SourceDiagnostics {
            events_sent: self.stats.sent.load(Ordering::Relaxed),
            overflow_count: 0,
            watched_dirs: 1,
            platform_info: format!("poll interval {:?}", self.interval),
        }
    }
}

impl Drop for PollingSource {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Cycle {
    Continue,
    Stop,
}

struct Poller {
    target: WatchTargetId,
    root: PathBuf,
    recursive: bool,
    rules: Arc<ExcludeRules>,
    hash_contents: bool,
    last: Snapshot,
    tx: RawSender,
    stop_rx: Receiver<()>,
    stats: Arc<SourceStats>,
}

impl Poller {
    fn run(&mut self, interval: Duration) {
        loop {
            match self.stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
            if self.poll_once() == Cycle::Stop {
                break;
            }
        }
        debug!(target = %self.target, "poller exiting");
    }

    /// One walk-and-diff cycle
    fn poll_once(&mut self) -> Cycle {
        let fresh = match reconcile::scan(&self.root, self.recursive, &self.rules, self.hash_contents) {
            Ok(fresh) => fresh,
            Err(WatchError::RootLost(_)) => {
                let lost = RawEvent::new(self.target, self.root.clone(), BackendKind::Polling, RawAction::RootLost);
                self.send(lost);
                return Cycle::Stop;
            }
            Err(err) => {
                warn!(target = %self.target, "poll walk failed: {err}");
                return Cycle::Continue;
            }
        };

        let diff = TreeDiff::diff(&self.last, &fresh);
        self.last = fresh;
        if diff.is_empty() {
            return Cycle::Continue;
        }
        debug!(target = %self.target, changes = diff.len(), "poll cycle found changes");

        let deltas = diff
            .removed
            .into_iter()
            .map(|(path, _)| (path, PollDelta::Vanished))
            .chain(diff.added.into_iter().map(|(path, _)| (path, PollDelta::Appeared)))
            .chain(diff.modified.into_iter().map(|(path, _, _)| (path, PollDelta::Changed)))
            .chain(
                diff.attributes
                    .into_iter()
                    .map(|(path, _, _)| (path, PollDelta::AttributesChanged)),
            );

        for (path, delta) in deltas {
            let raw = RawEvent::new(self.target, path, BackendKind::Polling, RawAction::Polled(delta));
            if !self.send(raw) {
                return Cycle::Stop;
            }
        }
        Cycle::Continue
    }

    /// Blocking send that still honors a stop request
    fn send(&self, raw: RawEvent) -> bool {
        select! {
            send(self.tx, raw) -> res => {
                if res.is_ok() {
                    self.stats.sent();
                }
                res.is_ok()
            }
            recv(self.stop_rx) -> _ => false,
        }
    }
}
