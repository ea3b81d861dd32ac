//! File state snapshots and snapshot diffing

use crate::hash::ContentHash;
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs::{FileType, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Type of filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    /// Symbolic link (never followed)
    Symlink,
    /// Sockets, fifos, devices
    Other,
}

impl EntryKind {
    pub fn from_file_type(file_type: FileType) -> Self {
        if file_type.is_symlink() {
            EntryKind::Symlink
        } else if file_type.is_dir() {
            EntryKind::Directory
        } else if file_type.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }

    pub fn is_dir(self) -> bool {
        self == EntryKind::Directory
    }
}

/// Device and inode pair; survives renames within one filesystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

/// Last known state of one path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileState {
    pub kind: EntryKind,
    pub size: u64,
    pub modified: Option<SystemTime>,
    /// Permission bits (unix mode, or a readonly approximation elsewhere)
    pub mode: u32,
    pub identity: Option<FileIdentity>,
    pub hash: Option<ContentHash>,
}

impl FileState {
    /// Capture state from `symlink_metadata`
    pub fn from_metadata(meta: &Metadata) -> Self {
        Self {
            kind: EntryKind::from_file_type(meta.file_type()),
            size: meta.len(),
            modified: meta.modified().ok(),
            mode: mode_bits(meta),
            identity: identity(meta),
            hash: None,
        }
    }

    pub fn with_hash(mut self, hash: Option<ContentHash>) -> Self {
        self.hash = hash;
        self
    }

    /// Whether the content (or the object behind the path) changed
    ///
    /// Directory timestamps move whenever a child changes, so directories
    /// only differ when they were replaced.
    pub fn content_differs(&self, other: &FileState) -> bool {
        if self.kind != other.kind {
            return true;
        }
        if let (Some(a), Some(b)) = (self.identity, other.identity) {
            if a != b {
                return true;
            }
        }
        if self.kind.is_dir() {
            return false;
        }
        if self.size != other.size || self.modified != other.modified {
            return true;
        }
        match (self.hash, other.hash) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }

    /// Whether only metadata bits changed
    pub fn attributes_differ(&self, other: &FileState) -> bool {
        self.mode != other.mode
    }

    /// Whether two states plausibly describe the same object before and after a move
    ///
    /// Device and inode decide when both sides carry them; otherwise size,
    /// mtime and kind must all agree.
    pub fn same_file(&self, other: &FileState) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match (self.identity, other.identity) {
            (Some(a), Some(b)) => a == b,
            _ => self.size == other.size && self.modified.is_some() && self.modified == other.modified,
        }
    }
}

#[cfg(unix)]
fn mode_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn mode_bits(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
fn identity(meta: &Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_meta: &Metadata) -> Option<FileIdentity> {
    None
}

/// Flat path to state map of a subtree at one point in time
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: AHashMap<PathBuf, FileState>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: PathBuf, state: FileState) -> Option<FileState> {
        self.entries.insert(path, state)
    }

    pub fn get(&self, path: &Path) -> Option<&FileState> {
        self.entries.get(path)
    }

    pub fn remove(&mut self, path: &Path) -> Option<FileState> {
        self.entries.remove(path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathBuf, &FileState)> {
        self.entries.iter()
    }

    /// Entries ordered so that every parent precedes its children
    pub fn sorted(&self) -> Vec<(&PathBuf, &FileState)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }
}

impl FromIterator<(PathBuf, FileState)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (PathBuf, FileState)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Differences between two snapshots
///
/// `added` is ordered parents first, `removed` children first, so applying
/// the lists in order never references a missing parent.
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    pub added: Vec<(PathBuf, FileState)>,
    pub removed: Vec<(PathBuf, FileState)>,
    /// Content changes (old, new)
    pub modified: Vec<(PathBuf, FileState, FileState)>,
    /// Permission-only changes (old, new)
    pub attributes: Vec<(PathBuf, FileState, FileState)>,
}

impl TreeDiff {
    pub fn diff(old: &Snapshot, new: &Snapshot) -> Self {
        let mut diff = TreeDiff::default();

        for (path, new_state) in new.iter() {
            match old.get(path) {
                None => diff.added.push((path.clone(), new_state.clone())),
                Some(old_state) if old_state.content_differs(new_state) => {
                    diff.modified
                        .push((path.clone(), old_state.clone(), new_state.clone()));
                }
                Some(old_state) if old_state.attributes_differ(new_state) => {
                    diff.attributes
                        .push((path.clone(), old_state.clone(), new_state.clone()));
                }
                Some(_) => {}
            }
        }
        for (path, old_state) in old.iter() {
            if !new.contains(path) {
                diff.removed.push((path.clone(), old_state.clone()));
            }
        }

        diff.added.sort_by(|a, b| a.0.cmp(&b.0));
        diff.removed.sort_by(|a, b| b.0.cmp(&a.0));
        diff.modified.sort_by(|a, b| a.0.cmp(&b.0));
        diff.attributes.sort_by(|a, b| a.0.cmp(&b.0));
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.modified.is_empty()
            && self.attributes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len() + self.attributes.len()
    }
}
