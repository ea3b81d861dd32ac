//! Subtree scanning and rescan recovery
//!
//! Walks a subtree into a flat `Snapshot`. The same walk builds the initial
//! mirror, drives polling cycles, and reconciles a target after its native
//! backend lost events.

use crate::ignore::ExcludeRules;
use std::fs::{self, Metadata};
use std::io::ErrorKind;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;
use tracing::debug;
use vigil_core::hash::hash_file_stable;
use vigil_core::{FileState, Result, Snapshot, WatchError};
use walkdir::WalkDir;

/// Scan a whole target
pub fn scan(root: &Path, recursive: bool, rules: &ExcludeRules, hash_contents: bool) -> Result<Snapshot> {
    scan_subtree(root, root, recursive, rules, hash_contents)
}

/// Scan `subtree`, which lies inside the target rooted at `root`
///
/// A missing subtree is reported as `RootLost(subtree)`. Entries that vanish
/// or turn unreadable mid-walk are skipped; churn is expected here.
pub fn scan_subtree(
    root: &Path,
    subtree: &Path,
    recursive: bool,
    rules: &ExcludeRules,
    hash_contents: bool,
) -> Result<Snapshot> {
    // 1. The subtree itself must exist
    let meta = match fs::symlink_metadata(subtree) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => {
            return Err(WatchError::RootLost(subtree.to_path_buf()));
        }
        Err(err) => return Err(err.into()),
    };

    let mut snapshot = Snapshot::new();
    snapshot.insert(subtree.to_path_buf(), state_for(subtree, &meta, hash_contents));
    if !meta.is_dir() {
        return Ok(snapshot);
    }

    // 2. Depth is bounded relative to the root, not the subtree
    let below_root = subtree
        .strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(0);
    let max_depth = if recursive {
        usize::MAX
    } else {
        1usize.saturating_sub(below_root)
    };

    // 3. Walk, pruning excluded directories
    let walker = WalkDir::new(subtree)
        .follow_links(false)
        .min_depth(1)
        .max_depth(max_depth)
        .into_iter()
        .filter_entry(|entry| !rules.is_excluded(entry.path(), entry.file_type().is_dir()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping during scan: {err}");
                continue;
            }
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        snapshot.insert(
            entry.path().to_path_buf(),
            state_for(entry.path(), &meta, hash_contents),
        );
    }

    Ok(snapshot)
}

/// Current state of one path, without following symlinks
pub fn stat(path: &Path, hash_contents: bool) -> Option<FileState> {
    let meta = fs::symlink_metadata(path).ok()?;
    Some(state_for(path, &meta, hash_contents))
}

/// Rescan with bounded retries
///
/// Backs off 50ms, 100ms, 200ms... between attempts so a root that is being
/// replaced has a chance to reappear.
pub fn rescan_with_retry(
    root: &Path,
    subtree: &Path,
    recursive: bool,
    rules: &ExcludeRules,
    hash_contents: bool,
    attempts: u8,
) -> Result<Snapshot> {
    let attempts = attempts.max(1);
    let mut last_err = None;
    for attempt in 0..attempts {
        match scan_subtree(root, subtree, recursive, rules, hash_contents) {
            Ok(snapshot) => return Ok(snapshot),
            Err(err) => {
                debug!(attempt, "rescan of {} failed: {err}", subtree.display());
                last_err = Some(err);
            }
        }
        if attempt + 1 < attempts {
            sleep(Duration::from_millis(50u64 << attempt));
        }
    }
    Err(last_err.unwrap_or_else(|| WatchError::RootLost(subtree.to_path_buf())))
}

fn state_for(path: &Path, meta: &Metadata, hash_contents: bool) -> FileState {
    let state = FileState::from_metadata(meta);
    if hash_contents && meta.is_file() {
        // A file mid-write hashes to nothing rather than to a torn digest
        state.with_hash(hash_file_stable(path, 2).ok())
    } else {
        state
    }
}
