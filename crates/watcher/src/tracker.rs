//! Directory tree tracker
//!
//! Owns one arena mirror per watch target. The mirror is the "before" state
//! for rename pairing and duplicate suppression, and the seed for polling.
//! Every emission is applied to the mirror under the tree's write lock
//! before the event is published, so a lookup made after receiving an
//! event already reflects it.

use crate::ignore::ExcludeRules;
use crate::reconcile;
use dashmap::DashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use vigil_core::{ChangeKind, DirTree, FileState, Result, Snapshot, TreeDiff, WatchError, WatchTarget, WatchTargetId};

/// Mirror plus liveness flag, guarded together
#[derive(Debug)]
pub struct TreeState {
    alive: bool,
    mirror: DirTree,
}

impl TreeState {
    pub fn is_alive(&self) -> bool {
        self.alive
    }

    pub fn mirror(&self) -> &DirTree {
        &self.mirror
    }
}

/// Side effects of applying one change
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Applied {
    /// Directories that now need a subscription
    pub added_dirs: Vec<PathBuf>,
    /// Directories whose subscription can go
    pub removed_dirs: Vec<PathBuf>,
    /// Entries found inside a new directory before it was subscribed
    pub discovered: Vec<PathBuf>,
}

/// One target's mirror
#[derive(Debug)]
pub struct TargetTree {
    target: Arc<WatchTarget>,
    rules: Arc<ExcludeRules>,
    hash_contents: bool,
    state: RwLock<TreeState>,
}

impl TargetTree {
    pub fn target(&self) -> &Arc<WatchTarget> {
        &self.target
    }

    pub fn read(&self) -> RwLockReadGuard<'_, TreeState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, TreeState> {
        self.state.write()
    }

    /// Apply one finalized change to the mirror
    ///
    /// `discover` scans new directories for contents that appeared before a
    /// subscription existed; `skip` names paths that will report themselves.
    pub fn apply(
        &self,
        state: &mut TreeState,
        kind: &ChangeKind,
        path: &Path,
        discover: bool,
        skip: &dyn Fn(&Path) -> bool,
    ) -> Applied {
        let mut applied = Applied::default();
        match kind {
            ChangeKind::Created | ChangeKind::Modified | ChangeKind::AttributesChanged => {
                self.refresh(state, path, discover, skip, &mut applied);
            }
            ChangeKind::Deleted => self.forget(state, path, &mut applied),
            ChangeKind::Renamed { from, to } => {
                let moved_dirs: Vec<PathBuf> = subtree_dirs(&state.mirror, from);
                if self.target.covers(to) && state.mirror.move_node(from, to) {
                    if let Some(fresh) = reconcile::stat(to, self.hash_contents) {
                        state.mirror.upsert(to, fresh);
                    }
                    applied.removed_dirs = moved_dirs;
                    if self.target.recursive {
                        applied.added_dirs = subtree_dirs(&state.mirror, to);
                    }
                } else {
                    // Only one side is ours: a move out of, or into, this target
                    self.forget(state, from, &mut applied);
                    if self.target.covers(to) {
                        self.refresh(state, to, discover, skip, &mut applied);
                    }
                }
            }
        }
        applied
    }

    /// Rebuild `subtree` from a fresh scan and return the reconciling diff
    pub fn reconcile(&self, state: &mut TreeState, subtree: &Path, fresh: &Snapshot) -> TreeDiff {
        let stale = state.mirror.snapshot(subtree);
        let diff = TreeDiff::diff(&stale, fresh);
        state.mirror.replace_subtree(subtree, fresh);
        debug!(
            target = %self.target.id,
            added = diff.added.len(),
            removed = diff.removed.len(),
            modified = diff.modified.len(),
            "reconciled {}",
            subtree.display()
        );
        diff
    }

    /// Mark dead; later emissions for this target are dropped
    pub fn kill(&self, state: &mut TreeState) {
        state.alive = false;
    }

    fn refresh(&self, state: &mut TreeState, path: &Path, discover: bool, skip: &dyn Fn(&Path) -> bool, applied: &mut Applied) {
        if !self.target.covers(path) || self.rules.is_excluded(path, path.is_dir()) {
            return;
        }
        let Some(fresh) = reconcile::stat(path, self.hash_contents) else {
            // Gone again already; its deletion closes in a later burst
            return;
        };

        let was_dir = state.mirror.state(path).is_some_and(|s| s.kind.is_dir());
        let is_dir = fresh.kind.is_dir();
        if state.mirror.upsert(path, fresh.clone()).is_none() {
            self.insert_with_ancestors(state, path, fresh);
        }
        if was_dir && !is_dir {
            applied.removed_dirs.push(path.to_path_buf());
        }
        if !is_dir || was_dir || path == self.target.root || !self.target.recursive {
            return;
        }

        applied.added_dirs.push(path.to_path_buf());
        if !discover {
            return;
        }
        let found = match reconcile::scan_subtree(&self.target.root, path, true, &self.rules, self.hash_contents) {
            Ok(found) => found,
            Err(err) => {
                debug!("discovery scan of {} failed: {err}", path.display());
                return;
            }
        };
        for (child, child_state) in found.sorted() {
            if child == path || skip(child) || state.mirror.contains(child) {
                continue;
            }
            if state.mirror.upsert(child, child_state.clone()).is_some() {
                if child_state.kind.is_dir() {
                    applied.added_dirs.push(child.clone());
                }
                applied.discovered.push(child.clone());
            }
        }
    }

    fn forget(&self, state: &mut TreeState, path: &Path, applied: &mut Applied) {
        for (removed, removed_state) in state.mirror.remove(path) {
            if removed_state.kind.is_dir() {
                applied.removed_dirs.push(removed);
            }
        }
    }

    /// Fill in ancestors the mirror missed (created and populated between walks)
    fn insert_with_ancestors(&self, state: &mut TreeState, path: &Path, fresh: FileState) {
        let missing: Vec<&Path> = path
            .ancestors()
            .skip(1)
            .take_while(|ancestor| ancestor.starts_with(&self.target.root) && !state.mirror.contains(ancestor))
            .collect();
        for ancestor in missing.into_iter().rev() {
            match reconcile::stat(ancestor, self.hash_contents) {
                Some(ancestor_state) => {
                    state.mirror.upsert(ancestor, ancestor_state);
                }
                None => return,
            }
        }
        state.mirror.upsert(path, fresh);
    }
}

fn subtree_dirs(mirror: &DirTree, path: &Path) -> Vec<PathBuf> {
    let Some(id) = mirror.lookup(path) else {
        return Vec::new();
    };
    mirror
        .descendants(id)
        .into_iter()
        .filter_map(|id| mirror.node(id))
        .filter(|node| node.is_dir())
        .map(|node| node.path.clone())
        .collect()
}

/// Registry of target mirrors
#[derive(Debug)]
pub struct TreeTracker {
    trees: DashMap<WatchTargetId, Arc<TargetTree>>,
    hash_contents: bool,
}

impl TreeTracker {
    pub fn new(hash_contents: bool) -> Self {
        Self {
            trees: DashMap::new(),
            hash_contents,
        }
    }

    /// Build the initial mirror for `target`
    pub fn attach(&self, target: Arc<WatchTarget>, rules: Arc<ExcludeRules>) -> Result<Arc<TargetTree>> {
        let snapshot = reconcile::scan(&target.root, target.recursive, &rules, self.hash_contents)?;
        let mirror = DirTree::from_snapshot(&target.root, &snapshot)
            .ok_or_else(|| WatchError::RootLost(target.root.clone()))?;
        info!(target = %target.id, entries = mirror.len(), "mirrored {}", target.root.display());

        let tree = Arc::new(TargetTree {
            target: target.clone(),
            rules,
            hash_contents: self.hash_contents,
            state: RwLock::new(TreeState { alive: true, mirror }),
        });
        self.trees.insert(target.id, tree.clone());
        Ok(tree)
    }

    /// Drop a target's mirror
    ///
    /// Takes the write lock before returning, so any publication already
    /// holding it has finished and no later one can start.
    pub fn detach(&self, id: WatchTargetId) -> bool {
        match self.trees.remove(&id) {
            Some((_, tree)) => {
                tree.kill(&mut tree.write());
                true
            }
            None => false,
        }
    }

    pub fn tree(&self, id: WatchTargetId) -> Option<Arc<TargetTree>> {
        self.trees.get(&id).map(|t| t.value().clone())
    }

    /// Mirror state for `path` from any live tree covering it
    pub fn known(&self, path: &Path) -> Option<FileState> {
        // Clone the handles out so no shard lock is held while locking a tree
        let trees: Vec<Arc<TargetTree>> = self.trees.iter().map(|t| t.value().clone()).collect();
        trees
            .iter()
            .filter(|tree| tree.target.covers(path))
            .find_map(|tree| {
                let state = tree.read();
                if state.alive {
                    state.mirror.state(path).cloned()
                } else {
                    None
                }
            })
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }
}
