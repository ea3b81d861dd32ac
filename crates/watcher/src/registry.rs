//! Path registry
//!
//! Holds the watched roots. Roots are canonicalized on registration, so the
//! same directory reached through two spellings is one target. Overlapping
//! roots (a parent and one of its children) are separate targets.

use crate::ignore::{ExcludeConfig, ExcludeRules};
use crate::platform::{EventSource, SourceDiagnostics};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;
use vigil_core::{BackendKind, Result, WatchError, WatchTarget, WatchTargetId};

/// Options for one watch target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOptions {
    /// Watch the whole tree, not just the root's direct entries (default: true)
    pub recursive: bool,

    /// Gitignore-syntax globs, relative to the root
    pub exclude_patterns: Vec<String>,

    /// Honor the root's `.gitignore` (default: false)
    pub use_gitignore: bool,

    /// Skip editor swap files and OS litter (default: false)
    pub skip_editor_temp: bool,
}

impl Default for TargetOptions {
    fn default() -> Self {
        Self {
            recursive: true,
            exclude_patterns: Vec::new(),
            use_gitignore: false,
            skip_editor_temp: false,
        }
    }
}

/// Lifecycle of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    /// Registered, engine not started
    Idle,
    Active(BackendKind),
    /// Rescanning after an overflow or a vanished root
    Recovering,
    /// Rescan kept failing; terminal
    Lost,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetStatus::Idle => write!(f, "idle"),
            TargetStatus::Active(kind) => write!(f, "active ({kind})"),
            TargetStatus::Recovering => write!(f, "recovering"),
            TargetStatus::Lost => write!(f, "lost"),
        }
    }
}

/// A registered target with its rules, status and running source
pub struct TargetEntry {
    target: Arc<WatchTarget>,
    rules: Arc<ExcludeRules>,
    status: Mutex<TargetStatus>,
    source: Mutex<Option<Box<dyn EventSource>>>,
}

impl fmt::Debug for TargetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetEntry")
            .field("target", &self.target)
            .field("status", &*self.status.lock())
            .finish_non_exhaustive()
    }
}

impl TargetEntry {
    pub fn target(&self) -> &Arc<WatchTarget> {
        &self.target
    }

    pub fn rules(&self) -> &Arc<ExcludeRules> {
        &self.rules
    }

    pub fn status(&self) -> TargetStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TargetStatus) {
        *self.status.lock() = status;
    }

    pub fn is_lost(&self) -> bool {
        self.status() == TargetStatus::Lost
    }

    /// Install a running source, stopping any previous one
    pub fn install_source(&self, source: Box<dyn EventSource>) {
        let kind = source.kind();
        let previous = self.source.lock().replace(source);
        if let Some(mut previous) = previous {
            previous.stop();
        }
        self.set_status(TargetStatus::Active(kind));
    }

    /// Stop and drop the source; idempotent
    pub fn stop_source(&self) {
        let source = self.source.lock().take();
        if let Some(mut source) = source {
            source.stop();
        }
    }

    /// Run `f` against the running source, if there is one
    pub fn with_source<R>(&self, f: impl FnOnce(&mut dyn EventSource) -> R) -> Option<R> {
        let mut source = self.source.lock();
        source.as_mut().map(|s| f(s.as_mut()))
    }

    pub fn take_overflow(&self) -> bool {
        self.with_source(|s| s.take_overflow()).unwrap_or(false)
    }

    /// Whether new subdirectories need explicit subscriptions
    pub fn needs_dir_watches(&self) -> bool {
        self.target.recursive && self.with_source(|s| !s.recurses_natively()).unwrap_or(false)
    }

    pub fn source_kind(&self) -> Option<BackendKind> {
        self.with_source(|s| s.kind())
    }

    pub fn diagnostics(&self) -> Option<SourceDiagnostics> {
        self.with_source(|s| s.diagnostics())
    }
}

#[derive(Debug)]
pub struct PathRegistry {
    targets: DashMap<WatchTargetId, Arc<TargetEntry>>,
    next_id: AtomicU64,
    // Serializes the duplicate check with the insert
    register_lock: Mutex<()>,
}

impl Default for PathRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PathRegistry {
    pub fn new() -> Self {
        Self {
            targets: DashMap::new(),
            next_id: AtomicU64::new(1),
            register_lock: Mutex::new(()),
        }
    }

    /// Register a root
    ///
    /// Fails with `InvalidPath` if the path cannot be resolved, with
    /// `DuplicateWatch` if the canonical root is already registered (a `Lost`
    /// target is replaced instead), and with `InvalidPattern` on a bad glob.
    pub fn register(&self, path: &Path, options: &TargetOptions) -> Result<Arc<TargetEntry>> {
        let root = path.canonicalize().map_err(|source| WatchError::InvalidPath {
            path: path.to_path_buf(),
            source,
        })?;

        let rules = ExcludeRules::build(
            &root,
            ExcludeConfig {
                patterns: options.exclude_patterns.clone(),
                use_gitignore: options.use_gitignore,
                skip_editor_temp: options.skip_editor_temp,
            },
        )?;

        let _guard = self.register_lock.lock();
        let existing = self
            .targets
            .iter()
            .find(|e| e.target.root == root)
            .map(|e| e.value().clone());
        if let Some(existing) = existing {
            if !existing.is_lost() {
                return Err(WatchError::DuplicateWatch {
                    path: root,
                    existing: existing.target.id,
                });
            }
            info!(target = %existing.target.id, "replacing lost target for {}", root.display());
            self.targets.remove(&existing.target.id);
        }

        let id = WatchTargetId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let target = WatchTarget {
            id,
            root,
            recursive: options.recursive,
            exclude_patterns: options.exclude_patterns.iter().cloned().collect::<BTreeSet<_>>(),
        };
        let entry = Arc::new(TargetEntry {
            target: Arc::new(target),
            rules: Arc::new(rules),
            status: Mutex::new(TargetStatus::Idle),
            source: Mutex::new(None),
        });
        self.targets.insert(id, entry.clone());
        info!(target = %id, recursive = options.recursive, "registered {}", entry.target.root.display());
        Ok(entry)
    }

    /// Remove a target and stop its source
    pub fn unregister(&self, id: WatchTargetId) -> Result<Arc<TargetEntry>> {
        let (_, entry) = self.targets.remove(&id).ok_or(WatchError::UnknownTarget(id))?;
        entry.stop_source();
        info!(target = %id, "unregistered {}", entry.target.root.display());
        Ok(entry)
    }

    pub fn get(&self, id: WatchTargetId) -> Option<Arc<TargetEntry>> {
        self.targets.get(&id).map(|e| e.value().clone())
    }

    /// All entries, ordered by id
    pub fn entries(&self) -> Vec<Arc<TargetEntry>> {
        let mut entries: Vec<_> = self.targets.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.target.id);
        entries
    }

    /// Live targets whose scope includes `path`, deepest root first
    pub fn covering(&self, path: &Path) -> Vec<Arc<TargetEntry>> {
        let mut covering: Vec<_> = self
            .targets
            .iter()
            .filter(|e| !e.is_lost() && e.target.covers(path))
            .map(|e| e.value().clone())
            .collect();
        covering.sort_by(|a, b| b.target.depth().cmp(&a.target.depth()).then(a.target.id.cmp(&b.target.id)));
        covering
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
