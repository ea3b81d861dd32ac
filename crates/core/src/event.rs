//! Watch targets and change events

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Opaque identifier of a registered watch target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatchTargetId(u64);

impl WatchTargetId {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WatchTargetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A registered root with its recursion and exclusion rules
///
/// Immutable once registered. Changing a rule means unregistering and
/// registering again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    pub id: WatchTargetId,
    /// Canonical absolute root
    pub root: PathBuf,
    pub recursive: bool,
    /// Globs in gitignore syntax, relative to `root`
    pub exclude_patterns: BTreeSet<String>,
}

impl WatchTarget {
    /// Whether `path` lies inside the part of the tree this target observes
    ///
    /// A non-recursive target covers its root and the root's direct children.
    pub fn covers(&self, path: &Path) -> bool {
        match path.strip_prefix(&self.root) {
            Ok(rel) => self.recursive || rel.components().count() <= 1,
            Err(_) => false,
        }
    }

    /// Number of components in the root, used to rank overlapping targets
    pub fn depth(&self) -> usize {
        self.root.components().count()
    }
}

/// Which backend observes a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// OS notification facility (inotify, FSEvents, ReadDirectoryChangesW)
    Native,
    /// Periodic stat-and-diff walks
    Polling,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Native => f.write_str("native"),
            BackendKind::Polling => f.write_str("polling"),
        }
    }
}

/// Semantic kind of a finalized change
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: PathBuf, to: PathBuf },
    AttributesChanged,
}

impl ChangeKind {
    /// Short lowercase label for display and structured output
    pub fn label(&self) -> &'static str {
        match self {
            ChangeKind::Created => "created",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Renamed { .. } => "renamed",
            ChangeKind::AttributesChanged => "attributes",
        }
    }
}

/// One finalized change, as delivered to consumers
///
/// For a rename, `path` is the destination and the source lives in the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub occurred_at: SystemTime,
    pub target: WatchTargetId,
}

impl ChangeEvent {
    pub fn new(path: PathBuf, kind: ChangeKind, occurred_at: SystemTime, target: WatchTargetId) -> Self {
        Self {
            path,
            kind,
            occurred_at,
            target,
        }
    }

    /// Build a rename event; `path` is set to the destination
    pub fn renamed(from: PathBuf, to: PathBuf, occurred_at: SystemTime, target: WatchTargetId) -> Self {
        Self {
            path: to.clone(),
            kind: ChangeKind::Renamed { from, to },
            occurred_at,
            target,
        }
    }
}

impl fmt::Display for ChangeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ChangeKind::Renamed { from, to } => {
                write!(f, "renamed {} -> {}", from.display(), to.display())
            }
            kind => write!(f, "{} {}", kind.label(), self.path.display()),
        }
    }
}
