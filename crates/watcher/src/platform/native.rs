//! Native OS notification backend
//!
//! Wraps notify's recommended watcher (inotify, FSEvents,
//! ReadDirectoryChangesW). Every directory is subscribed non-recursively so
//! new subdirectories are picked up explicitly through `watch_dir`. The
//! notify callback never blocks: a full hand-off channel raises the
//! overflow flag and the pipeline rescans.

use super::{EventSource, RawAction, RawEvent, RawSender, SourceDiagnostics, SourceStats};
use ahash::AHashSet;
use crossbeam_channel::TrySendError;
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use smallvec::SmallVec;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_core::{BackendKind, Result, WatchError, WatchTarget, WatchTargetId};

pub struct NativeSource {
    target: WatchTargetId,
    watcher: Option<RecommendedWatcher>,
    watched: AHashSet<PathBuf>,
    overflow: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
}

impl NativeSource {
    /// Subscribe the root and, for recursive targets, every known directory
    ///
    /// Any refusal fails the whole start so the caller can fall back to
    /// polling for this root.
    pub fn start(target: &WatchTarget, dirs: &[PathBuf], tx: RawSender) -> Result<Self> {
        let overflow = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SourceStats::default());
        let forwarder = Forwarder {
            target: target.id,
            root: target.root.clone(),
            tx,
            overflow: overflow.clone(),
            stats: stats.clone(),
        };

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| forwarder.handle(res),
            notify::Config::default(),
        )
        .map_err(|err| refused(&target.root, &err))?;

        let mut watched = AHashSet::new();

        // 1. Root first
        watcher
            .watch(&target.root, RecursiveMode::NonRecursive)
            .map_err(|err| refused(&target.root, &err))?;
        watched.insert(target.root.clone());

        // 2. Known subdirectories
        if target.recursive {
            for dir in dirs.iter().filter(|dir| **dir != target.root) {
                watcher
                    .watch(dir, RecursiveMode::NonRecursive)
                    .map_err(|err| refused(dir, &err))?;
                watched.insert(dir.clone());
            }
        }

        info!(
            target = %target.id,
            dirs = watched.len(),
            "native watching {}",
            target.root.display()
        );

        Ok(Self {
            target: target.id,
            watcher: Some(watcher),
            watched,
            overflow,
            stats,
        })
    }
}

impl EventSource for NativeSource {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn recurses_natively(&self) -> bool {
        false
    }

    fn watch_dir(&mut self, dir: &Path) -> Result<()> {
        let Some(watcher) = self.watcher.as_mut() else {
            return Ok(());
        };
        if self.watched.contains(dir) {
            return Ok(());
        }
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|err| refused(dir, &err))?;
        debug!(target = %self.target, "subscribed {}", dir.display());
        self.watched.insert(dir.to_path_buf());
        Ok(())
    }

    fn unwatch_dir(&mut self, dir: &Path) {
        if !self.watched.remove(dir) {
            return;
        }
        if let Some(watcher) = self.watcher.as_mut() {
            // The kernel drops watches on deleted directories by itself
            let _ = watcher.unwatch(dir);
        }
    }

    fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }

    fn stop(&mut self) {
        if self.watcher.take().is_some() {
            self.watched.clear();
            debug!(target = %self.target, "native source stopped");
        }
    }

    fn is_running(&self) -> bool {
        self.watcher.is_some()
    }

    fn diagnostics(&self) -> SourceDiagnostics {
        SourceDiagnostics {
            events_sent: self.stats.sent.load(Ordering::Relaxed),
            overflow_count: self.stats.overflows.load(Ordering::Relaxed),
            watched_dirs: self.watched.len(),
            platform_info: format!("{:?}", RecommendedWatcher::kind()),
        }
    }
}

fn refused(path: &Path, err: &notify::Error) -> WatchError {
    WatchError::BackendSubscription {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Callback state living on notify's thread
struct Forwarder {
    target: WatchTargetId,
    root: PathBuf,
    tx: RawSender,
    overflow: Arc<AtomicBool>,
    stats: Arc<SourceStats>,
}

impl Forwarder {
    fn handle(&self, res: notify::Result<Event>) {
        let event = match res {
            Ok(event) => event,
            Err(err) => {
                warn!(target = %self.target, "native backend error: {err}");
                self.raise_overflow();
                return;
            }
        };

        if event.need_rescan() {
            warn!(target = %self.target, "native backend dropped events");
            self.raise_overflow();
            return;
        }

        for raw in self.split(event) {
            match self.tx.try_send(raw) {
                Ok(()) => self.stats.sent(),
                Err(TrySendError::Full(_)) => {
                    self.raise_overflow();
                    return;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    fn raise_overflow(&self) {
        if !self.overflow.swap(true, Ordering::AcqRel) {
            self.stats.overflowed();
        }
    }

    /// One raw event per affected path
    ///
    /// Two-path renames become a from/to pair sharing a cookie, and
    /// direction-less renames are resolved by whether the path still exists.
    fn split(&self, event: Event) -> SmallVec<[RawEvent; 2]> {
        let cookie = event.tracker();
        let mut out = SmallVec::new();

        match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
                let from = rename_half(RenameMode::From);
                let to = rename_half(RenameMode::To);
                let mut paths = event.paths.into_iter();
                if let (Some(src), Some(dst)) = (paths.next(), paths.next()) {
                    out.push(self.raw(src, from).with_cookie(cookie));
                    out.push(self.raw(dst, to).with_cookie(cookie));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any | RenameMode::Other)) => {
                for path in event.paths {
                    let mode = if path.exists() { RenameMode::To } else { RenameMode::From };
                    out.push(self.raw(path, rename_half(mode)).with_cookie(cookie));
                }
            }
            kind => {
                for path in event.paths {
                    out.push(self.raw(path, kind).with_cookie(cookie));
                }
            }
        }
        out
    }

    fn raw(&self, path: PathBuf, kind: EventKind) -> RawEvent {
        let gone = matches!(
            kind,
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From))
        );
        let action = if gone && path == self.root {
            RawAction::RootLost
        } else {
            RawAction::Native(kind)
        };
        RawEvent::new(self.target, path, BackendKind::Native, action)
    }
}

fn rename_half(mode: RenameMode) -> EventKind {
    EventKind::Modify(ModifyKind::Name(mode))
}
