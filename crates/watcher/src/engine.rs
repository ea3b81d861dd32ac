//! The watch engine
//!
//! Sources push raw events into one bounded channel. A single pipeline
//! thread normalizes them, feeds the coalescing window, and closes due
//! bursts. Each closed burst is applied to the owning target's mirror and
//! published while that tree's write lock is held. Recovery rescans run on
//! their own threads and publish through the same lock.

use crate::coalesce::{Coalescer, Emission, Resolver};
use crate::debounce::Window;
use crate::dispatch::{AlertChannel, Dispatcher, Subscription, SubscriptionId};
use crate::normalize::{normalize, Normalized};
use crate::platform::{self, PollingSource, RawEvent, RawSender, SourceDiagnostics};
use crate::reconcile;
use crate::registry::{PathRegistry, TargetEntry, TargetOptions, TargetStatus};
use crate::tracker::{Applied, TargetTree, TreeTracker};
use crate::{MetricsSnapshot, WatcherConfig, WatcherMetrics};
use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use vigil_core::{
    ChangeEvent, ChangeKind, FileState, Result, TreeDiff, WatchError, WatchTarget, WatchTargetId,
};

/// Raw events handled per wakeup before deadlines are checked again
const RAW_BATCH: usize = 1024;

/// File-change watcher over any number of roots
///
/// ```no_run
/// use vigil_watcher::{Watcher, WatcherConfig};
///
/// # fn main() -> vigil_watcher::Result<()> {
/// let watcher = Watcher::new(WatcherConfig::default());
/// watcher.configure_target("/srv/data".as_ref(), true, &["*.tmp".to_string()])?;
/// let events = watcher.subscribe();
/// watcher.start()?;
/// while let Some(event) = events.try_recv() {
///     println!("{event}");
/// }
/// watcher.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct Watcher {
    inner: Arc<Inner>,
}

struct Inner {
    config: WatcherConfig,
    registry: PathRegistry,
    tracker: TreeTracker,
    coalescer: Coalescer,
    dispatcher: Dispatcher,
    metrics: WatcherMetrics,
    raw_tx: RawSender,
    raw_rx: Receiver<RawEvent>,
    running: AtomicBool,
    pipeline: Mutex<Option<Pipeline>>,
}

struct Pipeline {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Why a target is being rescanned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Overflow,
    RootLost,
}

impl Watcher {
    pub fn new(config: WatcherConfig) -> Self {
        let (raw_tx, raw_rx) = crossbeam_channel::bounded(config.event_queue_capacity.max(1));
        let window = Window::new(config.debounce_interval, config.debounce_hard_cap);
        let inner = Inner {
            registry: PathRegistry::new(),
            tracker: TreeTracker::new(config.hash_contents),
            coalescer: Coalescer::new(window),
            dispatcher: Dispatcher::new(config.consumer_queue_capacity),
            metrics: WatcherMetrics::default(),
            raw_tx,
            raw_rx,
            running: AtomicBool::new(false),
            pipeline: Mutex::new(None),
            config,
        };
        Self { inner: Arc::new(inner) }
    }

    pub fn config(&self) -> &WatcherConfig {
        &self.inner.config
    }

    /// Register a root with default options otherwise
    pub fn configure_target(&self, path: &Path, recursive: bool, exclude_patterns: &[String]) -> Result<WatchTargetId> {
        self.configure_target_with(
            path,
            TargetOptions {
                recursive,
                exclude_patterns: exclude_patterns.to_vec(),
                ..Default::default()
            },
        )
    }

    /// Register a root, mirror it, and start observing it if the engine runs
    pub fn configure_target_with(&self, path: &Path, options: TargetOptions) -> Result<WatchTargetId> {
        let entry = self.inner.registry.register(path, &options)?;
        let id = entry.target().id;

        if let Err(err) = self.inner.tracker.attach(entry.target().clone(), entry.rules().clone()) {
            self.inner.registry.unregister(id)?;
            return Err(err);
        }

        if self.inner.running.load(Ordering::Acquire) {
            if let Err(err) = self.inner.start_source(&entry) {
                self.unregister(id)?;
                return Err(err);
            }
        }
        Ok(id)
    }

    /// Stop observing a target
    ///
    /// No event for `id` is published after this returns.
    pub fn unregister(&self, id: WatchTargetId) -> Result<()> {
        self.inner.registry.unregister(id)?;
        let discarded = self.inner.coalescer.discard_target(id);
        self.inner.tracker.detach(id);
        debug!(target = %id, discarded, "target released");
        Ok(())
    }

    /// Start every registered source and the pipeline thread
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        for entry in self.inner.registry.entries() {
            if entry.is_lost() {
                continue;
            }
            if let Err(err) = self.inner.start_source(&entry) {
                warn!(target = %entry.target().id, "could not start source: {err}");
            }
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let inner = self.inner.clone();
        let handle = match thread::Builder::new()
            .name("vigil-pipeline".into())
            .spawn(move || inner.run(stop_rx))
        {
            Ok(handle) => handle,
            Err(err) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(WatchError::Pipeline(format!("spawning pipeline: {err}")));
            }
        };
        *self.inner.pipeline.lock() = Some(Pipeline { stop_tx, handle });

        info!(targets = self.inner.registry.len(), "watcher started");
        Ok(())
    }

    /// Stop sources, flush pending bursts, and join the pipeline
    pub fn stop(&self) -> Result<()> {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        for entry in self.inner.registry.entries() {
            entry.stop_source();
            if !entry.is_lost() {
                entry.set_status(TargetStatus::Idle);
            }
        }

        let pipeline = self.inner.pipeline.lock().take();
        if let Some(pipeline) = pipeline {
            // Either outcome wakes the loop: a unit, or a disconnect
            let _ = pipeline.stop_tx.try_send(());
            drop(pipeline.stop_tx);
            pipeline
                .handle
                .join()
                .map_err(|_| WatchError::Pipeline("pipeline thread panicked".into()))?;
        }

        info!(published = self.inner.dispatcher.published(), "watcher stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> Subscription {
        self.inner.dispatcher.subscribe()
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        self.inner.dispatcher.subscribe_with_capacity(capacity)
    }

    /// Attach a push-style channel; must be called inside a tokio runtime
    pub fn subscribe_channel(&self, channel: Arc<dyn AlertChannel>) -> Result<SubscriptionId> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|err| WatchError::Pipeline(format!("alert channels need a tokio runtime: {err}")))?;
        let name = channel.name().to_string();
        let id = self.inner.dispatcher.subscribe_channel(channel, &handle);
        info!(%id, channel = %name, "alert channel attached");
        Ok(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.dispatcher.unsubscribe(id)
    }

    /// Events dropped so far for each live subscriber
    pub fn drop_counts(&self) -> Vec<(SubscriptionId, u64)> {
        self.inner.dispatcher.drop_counts()
    }

    pub fn target(&self, id: WatchTargetId) -> Option<WatchTarget> {
        self.inner.registry.get(id).map(|e| e.target().as_ref().clone())
    }

    pub fn targets(&self) -> Vec<WatchTarget> {
        self.inner
            .registry
            .entries()
            .iter()
            .map(|e| e.target().as_ref().clone())
            .collect()
    }

    pub fn status(&self, id: WatchTargetId) -> Result<TargetStatus> {
        self.inner
            .registry
            .get(id)
            .map(|e| e.status())
            .ok_or(WatchError::UnknownTarget(id))
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Mirror state of `path`, as of the last event published for it
    pub fn lookup(&self, path: &Path) -> Option<FileState> {
        self.inner.tracker.known(path)
    }

    pub fn source_diagnostics(&self, id: WatchTargetId) -> Option<SourceDiagnostics> {
        self.inner.registry.get(id).and_then(|e| e.diagnostics())
    }
}

impl Drop for Watcher {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            warn!("stopping watcher on drop: {err}");
        }
        self.inner.dispatcher.close_all();
    }
}

/// Mirror as the "before" state, disk as the "after" state
struct EngineResolver<'a> {
    tracker: &'a TreeTracker,
    hash_contents: bool,
}

impl Resolver for EngineResolver<'_> {
    fn known(&self, path: &Path) -> Option<FileState> {
        self.tracker.known(path)
    }

    fn current(&self, path: &Path) -> Option<FileState> {
        reconcile::stat(path, self.hash_contents)
    }
}

impl Inner {
    fn resolver(&self) -> EngineResolver<'_> {
        EngineResolver {
            tracker: &self.tracker,
            hash_contents: self.config.hash_contents,
        }
    }

    /// Start the best available source, seeded from the target's mirror
    fn start_source(&self, entry: &TargetEntry) -> Result<()> {
        let target = entry.target();
        let tree = self
            .tracker
            .tree(target.id)
            .ok_or(WatchError::UnknownTarget(target.id))?;
        let (dirs, seed) = {
            let state = tree.read();
            (state.mirror().directories(), state.mirror().snapshot(&target.root))
        };
        let source = platform::start_source(
            target,
            &dirs,
            seed,
            entry.rules().clone(),
            &self.config,
            self.raw_tx.clone(),
        )?;
        entry.install_source(source);
        Ok(())
    }

    /// Replace a target's source with a polling one
    fn switch_to_polling(&self, entry: &TargetEntry) {
        let target = entry.target();
        let Some(tree) = self.tracker.tree(target.id) else {
            return;
        };
        let seed = tree.read().mirror().snapshot(&target.root);
        match PollingSource::start(target, seed, entry.rules().clone(), &self.config, self.raw_tx.clone()) {
            Ok(source) => {
                warn!(target = %target.id, "switched {} to polling", target.root.display());
                entry.install_source(Box::new(source));
            }
            Err(err) => warn!(target = %target.id, "polling fallback failed: {err}"),
        }
    }

    fn run(self: Arc<Self>, stop_rx: Receiver<()>) {
        debug!("pipeline running");
        let mut last_overflow_check = Instant::now();

        loop {
            let timeout = self.next_wake();
            select! {
                recv(stop_rx) -> _ => break,
                recv(self.raw_rx) -> raw => {
                    if let Ok(raw) = raw {
                        self.handle_raw(raw);
                        for raw in self.raw_rx.try_iter().take(RAW_BATCH) {
                            self.handle_raw(raw);
                        }
                    }
                }
                default(timeout) => {}
            }

            if last_overflow_check.elapsed() >= self.config.overflow_check_interval {
                self.check_overflow();
                last_overflow_check = Instant::now();
            }

            let ready = self.coalescer.collect_ready(Instant::now(), &self.resolver());
            for emission in ready {
                self.emit(emission);
            }
        }

        // Drain what the sources already handed over, then close every burst
        for raw in self.raw_rx.try_iter() {
            self.handle_raw(raw);
        }
        let rest = self.coalescer.flush(&self.resolver());
        debug!(flushed = rest.len(), "pipeline flushing");
        for emission in rest {
            self.emit(emission);
        }
    }

    fn next_wake(&self) -> Duration {
        let check = self.config.overflow_check_interval;
        match self.coalescer.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()).min(check),
            None => check,
        }
    }

    fn check_overflow(self: &Arc<Self>) {
        for entry in self.registry.entries() {
            if entry.take_overflow() {
                self.metrics.record_overflow();
                warn!(target = %entry.target().id, "events lost; rescanning {}", entry.target().root.display());
                let root = entry.target().root.clone();
                self.spawn_recovery(entry, root, Cause::Overflow);
            }
        }
    }

    fn handle_raw(self: &Arc<Self>, raw: RawEvent) {
        self.metrics.record_raw();
        let Some(entry) = self.registry.get(raw.target) else {
            self.metrics.record_filtered();
            return;
        };
        if entry.is_lost() {
            self.metrics.record_filtered();
            return;
        }

        match normalize(raw) {
            Normalized::Change(obs) => {
                if !entry.target().covers(&obs.path) || self.is_excluded(&entry, &obs.path) {
                    self.metrics.record_filtered();
                    return;
                }
                self.coalescer.push(obs, Instant::now());
            }
            Normalized::Rescan { path, .. } => {
                self.metrics.record_overflow();
                self.spawn_recovery(entry, path, Cause::Overflow);
            }
            Normalized::RootLost { .. } => {
                if entry.status() == TargetStatus::Recovering {
                    return;
                }
                let root = entry.target().root.clone();
                self.spawn_recovery(entry, root, Cause::RootLost);
            }
            Normalized::Ignored => self.metrics.record_filtered(),
        }
    }

    /// Exclusion check that also works for paths already gone from disk
    fn is_excluded(&self, entry: &TargetEntry, path: &Path) -> bool {
        let rules = entry.rules();
        let is_dir = match fs::symlink_metadata(path) {
            Ok(meta) => meta.is_dir(),
            Err(_) => match self.tracker.known(path) {
                Some(state) => state.kind.is_dir(),
                // Unknown and gone: a directory-only rule may still apply
                None => return rules.is_excluded(path, false) || rules.is_excluded(path, true),
            },
        };
        rules.is_excluded(path, is_dir)
    }

    fn spawn_recovery(self: &Arc<Self>, entry: Arc<TargetEntry>, subtree: PathBuf, cause: Cause) {
        let id = entry.target().id;
        entry.set_status(TargetStatus::Recovering);
        let inner = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("vigil-rescan-{}", id.get()))
            .spawn(move || inner.recover(&entry, &subtree, cause));
        if let Err(err) = spawned {
            warn!(target = %id, "could not spawn rescan: {err}");
        }
    }

    /// Rescan `subtree`, publish the reconciling diff, and resume observing
    fn recover(&self, entry: &TargetEntry, subtree: &Path, cause: Cause) {
        let target = entry.target().clone();
        let Some(tree) = self.tracker.tree(target.id) else {
            return;
        };

        // Bursts under the subtree are superseded by the diff
        let discarded = self.coalescer.discard_under(target.id, subtree);
        debug!(target = %target.id, discarded, ?cause, "rescanning {}", subtree.display());

        let scanned = reconcile::rescan_with_retry(
            &target.root,
            subtree,
            target.recursive,
            entry.rules(),
            self.config.hash_contents,
            self.config.max_rescan_attempts,
        );
        let fresh = match scanned {
            Ok(fresh) => fresh,
            Err(err) if subtree != target.root => {
                debug!("subtree rescan failed ({err}); widening to the root");
                return self.recover(entry, &target.root, cause);
            }
            Err(err) => return self.declare_lost(entry, &tree, err),
        };

        let (published, added_dirs, removed_dirs) = {
            let mut state = tree.write();
            if !state.is_alive() {
                return;
            }
            let diff = tree.reconcile(&mut state, subtree, &fresh);
            let events = diff_events(&diff, target.id, SystemTime::now());
            for event in &events {
                self.dispatcher.publish(event);
            }
            (events.len(), diff_dirs(&diff.added), diff_dirs(&diff.removed))
        };
        self.metrics.record_recovery(published);
        info!(target = %target.id, events = published, "recovered {}", subtree.display());

        if !self.running.load(Ordering::Acquire) || self.registry.get(target.id).is_none() {
            entry.set_status(TargetStatus::Idle);
            return;
        }

        let source_alive = entry.with_source(|s| s.is_running()).unwrap_or(false);
        if cause == Cause::RootLost || !source_alive {
            // The old subscription points at the vanished root
            entry.stop_source();
            if let Err(err) = self.start_source(entry) {
                warn!(target = %target.id, "could not restart source: {err}");
            }
            return;
        }

        let applied = Applied {
            added_dirs,
            removed_dirs,
            discovered: Vec::new(),
        };
        self.update_subscriptions(entry, &applied);
        if let Some(kind) = entry.source_kind() {
            entry.set_status(TargetStatus::Active(kind));
        }
    }

    /// Give up on a target: stop it and report everything it held as deleted
    fn declare_lost(&self, entry: &TargetEntry, tree: &TargetTree, err: WatchError) {
        let id = entry.target().id;
        warn!(target = %id, "giving up on {}: {err}", entry.target().root.display());

        entry.stop_source();
        entry.set_status(TargetStatus::Lost);
        self.coalescer.discard_target(id);

        {
            let mut state = tree.write();
            if state.is_alive() {
                let root = state.mirror().root_path().to_path_buf();
                let held = state.mirror().snapshot(&root);
                let mut paths: Vec<&PathBuf> = held.iter().map(|(path, _)| path).collect();
                paths.sort_by(|a, b| b.cmp(a));
                let now = SystemTime::now();
                for path in paths {
                    self.dispatcher
                        .publish(&ChangeEvent::new(path.clone(), ChangeKind::Deleted, now, id));
                    self.metrics.record_emitted(false);
                }
                tree.kill(&mut state);
            }
        }
        self.tracker.detach(id);
        self.metrics.record_lost();
    }

    /// Apply a closed burst to every covering mirror and publish it once
    fn emit(&self, emission: Emission) {
        let Emission {
            path,
            kind,
            targets,
            occurred_at,
        } = emission;

        let mut entries = self.registry.covering(&path);
        if let ChangeKind::Renamed { from, .. } = &kind {
            for entry in self.registry.covering(from) {
                if !entries.iter().any(|e| e.target().id == entry.target().id) {
                    entries.push(entry);
                }
            }
        }

        // Observers first, then the remaining covering targets, deepest first
        // within each group. The first live one owns the event.
        let (observers, bystanders): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|e| targets.contains(&e.target().id));
        let candidates: Vec<Arc<TargetEntry>> = observers.into_iter().chain(bystanders).collect();

        let skip = |p: &Path| self.coalescer.is_pending(p);
        let mut owner = None;
        for (i, entry) in candidates.iter().enumerate() {
            match self.publish_as(entry, &kind, &path, occurred_at, &skip) {
                Some(applied) => {
                    self.update_subscriptions(entry, &applied);
                    owner = Some(i);
                    break;
                }
                None => debug!(target = %entry.target().id, "target went away before {} was published", path.display()),
            }
        }
        let Some(owner) = owner else {
            debug!("no live target for {}", path.display());
            return;
        };

        // Overlapping targets keep their mirrors current without a second event
        for other in &candidates[owner + 1..] {
            let Some(other_tree) = self.tracker.tree(other.target().id) else {
                continue;
            };
            let applied = {
                let mut state = other_tree.write();
                if !state.is_alive() {
                    continue;
                }
                other_tree.apply(&mut state, &kind, &path, other.needs_dir_watches(), &skip)
            };
            self.update_subscriptions(other, &applied);
        }
    }

    /// Apply and publish under `entry`'s tree lock; `None` if the target is gone
    fn publish_as(
        &self,
        entry: &TargetEntry,
        kind: &ChangeKind,
        path: &Path,
        occurred_at: SystemTime,
        skip: &dyn Fn(&Path) -> bool,
    ) -> Option<Applied> {
        let id = entry.target().id;
        let tree = self.tracker.tree(id)?;

        let discover = entry.needs_dir_watches();
        if discover && path.is_dir() {
            // Subscribe before the discovery scan so nothing slips between them
            if let Some(Err(err)) = entry.with_source(|s| s.watch_dir(path)) {
                warn!(target = %id, "{err}");
            }
        }

        let mut state = tree.write();
        if !state.is_alive() {
            return None;
        }
        let applied = tree.apply(&mut state, kind, path, discover, skip);
        let event = ChangeEvent::new(path.to_path_buf(), kind.clone(), occurred_at, id);
        debug!(target = %event.target, "{event}");
        self.dispatcher.publish(&event);
        self.metrics.record_emitted(matches!(kind, ChangeKind::Renamed { .. }));

        for child in &applied.discovered {
            let event = ChangeEvent::new(child.clone(), ChangeKind::Created, SystemTime::now(), id);
            self.dispatcher.publish(&event);
            self.metrics.record_emitted(false);
        }
        Some(applied)
    }

    /// Track directory subscriptions for sources that need them
    fn update_subscriptions(&self, entry: &TargetEntry, applied: &Applied) {
        if applied.added_dirs.is_empty() && applied.removed_dirs.is_empty() {
            return;
        }
        if !entry.needs_dir_watches() {
            return;
        }
        let refused = entry.with_source(|source| {
            for dir in &applied.removed_dirs {
                source.unwatch_dir(dir);
            }
            applied
                .added_dirs
                .iter()
                .find_map(|dir| source.watch_dir(dir).err())
        });
        if let Some(Some(err)) = refused {
            warn!(target = %entry.target().id, "{err}; degrading to polling");
            self.switch_to_polling(entry);
        }
    }
}

/// Events that bring a consumer from the stale mirror to the fresh scan
fn diff_events(diff: &TreeDiff, target: WatchTargetId, at: SystemTime) -> Vec<ChangeEvent> {
    let removed = diff
        .removed
        .iter()
        .map(|(path, _)| ChangeEvent::new(path.clone(), ChangeKind::Deleted, at, target));
    let added = diff
        .added
        .iter()
        .map(|(path, _)| ChangeEvent::new(path.clone(), ChangeKind::Created, at, target));
    let modified = diff
        .modified
        .iter()
        .map(|(path, _, _)| ChangeEvent::new(path.clone(), ChangeKind::Modified, at, target));
    let attributes = diff
        .attributes
        .iter()
        .map(|(path, _, _)| ChangeEvent::new(path.clone(), ChangeKind::AttributesChanged, at, target));
    removed.chain(added).chain(modified).chain(attributes).collect()
}

fn diff_dirs(entries: &[(PathBuf, FileState)]) -> Vec<PathBuf> {
    entries
        .iter()
        .filter(|(_, state)| state.kind.is_dir())
        .map(|(path, _)| path.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn quick_config() -> WatcherConfig {
        WatcherConfig {
            debounce_interval: Duration::from_millis(50),
            polling_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[test]
    fn test_configure_mirrors_and_reports_idle() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        fs::write(root.join("a.txt"), b"a")?;

        let watcher = Watcher::new(quick_config());
        let id = watcher.configure_target(&root, true, &[])?;

        assert_eq!(watcher.status(id)?, TargetStatus::Idle);
        assert!(watcher.lookup(&root.join("a.txt")).is_some());
        assert_eq!(watcher.targets().len(), 1);
        assert_eq!(watcher.target(id).map(|t| t.root), Some(root));
        Ok(())
    }

    #[test]
    fn test_unregister_releases_everything() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        fs::write(root.join("a.txt"), b"a")?;

        let watcher = Watcher::new(quick_config());
        let id = watcher.configure_target(&root, true, &[])?;
        watcher.unregister(id)?;

        assert!(watcher.lookup(&root.join("a.txt")).is_none());
        assert!(matches!(watcher.status(id), Err(WatchError::UnknownTarget(_))));
        assert!(matches!(watcher.unregister(id), Err(WatchError::UnknownTarget(_))));

        // The root is free again
        watcher.configure_target(&root, true, &[])?;
        Ok(())
    }

    #[test]
    fn test_start_and_stop_are_idempotent() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let watcher = Watcher::new(quick_config());
        let id = watcher.configure_target(temp_dir.path(), false, &[])?;

        watcher.start()?;
        watcher.start()?;
        assert!(watcher.is_running());
        assert!(matches!(watcher.status(id)?, TargetStatus::Active(_)));
        assert!(watcher.source_diagnostics(id).is_some());

        watcher.stop()?;
        watcher.stop()?;
        assert_eq!(watcher.status(id)?, TargetStatus::Idle);
        Ok(())
    }

    #[test]
    fn test_degraded_target_keeps_reporting_by_polling() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        let from = root.join("a.txt");
        let to = root.join("b.txt");
        fs::write(&from, b"payload")?;

        let watcher = Watcher::new(quick_config());
        let id = watcher.configure_target(&root, true, &[])?;
        let sub = watcher.subscribe();
        watcher.start()?;

        let entry = watcher.inner.registry.get(id).ok_or(WatchError::UnknownTarget(id))?;
        watcher.inner.switch_to_polling(&entry);
        assert_eq!(watcher.status(id)?, TargetStatus::Active(vigil_core::BackendKind::Polling));

        fs::rename(&from, &to)?;
        let deadline = Instant::now() + Duration::from_secs(2);
        let mut events = Vec::new();
        while Instant::now() < deadline {
            match sub.try_recv() {
                Some(event) => events.push(event),
                None => thread::sleep(Duration::from_millis(10)),
            }
        }

        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(
            events[0].kind,
            ChangeKind::Renamed {
                from: from.clone(),
                to: to.clone()
            }
        );
        assert!(watcher.lookup(&from).is_none());
        assert!(watcher.lookup(&to).is_some());
        watcher.stop()?;
        Ok(())
    }

    #[test]
    fn test_emission_falls_to_outer_target_when_inner_goes_away() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().canonicalize()?;
        fs::create_dir(root.join("inner"))?;

        let watcher = Watcher::new(quick_config());
        let outer = watcher.configure_target(&root, true, &[])?;
        let inner = watcher.configure_target(&root.join("inner"), true, &[])?;
        let sub = watcher.subscribe();

        // The inner tree dies after the burst closed but before it was applied
        let file = root.join("inner/new.txt");
        fs::write(&file, b"hello")?;
        assert!(watcher.inner.tracker.detach(inner));
        watcher.inner.emit(Emission {
            path: file.clone(),
            kind: ChangeKind::Created,
            targets: smallvec::smallvec![inner],
            occurred_at: SystemTime::now(),
        });

        let events = sub.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].target, outer);
        assert_eq!(events[0].kind, ChangeKind::Created);
        assert_eq!(watcher.lookup(&file).map(|s| s.size), Some(5));
        Ok(())
    }

    #[test]
    fn test_diff_events_cover_every_delta() {
        let mut old = vigil_core::Snapshot::new();
        let mut new = vigil_core::Snapshot::new();
        let file = |size| FileState {
            kind: vigil_core::EntryKind::File,
            size,
            modified: None,
            mode: 0o644,
            identity: None,
            hash: None,
        };
        old.insert(PathBuf::from("/w/gone"), file(1));
        old.insert(PathBuf::from("/w/grew"), file(1));
        new.insert(PathBuf::from("/w/grew"), file(2));
        new.insert(PathBuf::from("/w/born"), file(1));

        let diff = TreeDiff::diff(&old, &new);
        let kinds: Vec<_> = diff_events(&diff, WatchTargetId::new(1), SystemTime::now())
            .into_iter()
            .map(|e| (e.path, e.kind))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (PathBuf::from("/w/gone"), ChangeKind::Deleted),
                (PathBuf::from("/w/born"), ChangeKind::Created),
                (PathBuf::from("/w/grew"), ChangeKind::Modified),
            ]
        );
    }
}
