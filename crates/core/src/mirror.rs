//! Arena-backed mirror of a watched directory tree
//!
//! Nodes live in one `Vec`; parents own their children through a name map
//! and children refer back by index only. Freed slots are reused. Bulk
//! reconciliation rebuilds whole subtrees instead of patching node by node.

use crate::tree::{FileState, Snapshot};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};

/// Index of a node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub path: PathBuf,
    pub state: FileState,
    parent: Option<NodeId>,
    children: BTreeMap<OsString, NodeId>,
}

impl TreeNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.children.values().copied()
    }

    pub fn is_dir(&self) -> bool {
        self.state.kind.is_dir()
    }
}

#[derive(Debug, Clone)]
pub struct DirTree {
    nodes: Vec<Option<TreeNode>>,
    free: Vec<NodeId>,
    root: NodeId,
    len: usize,
}

impl DirTree {
    pub fn new(root: PathBuf, state: FileState) -> Self {
        let node = TreeNode {
            path: root,
            state,
            parent: None,
            children: BTreeMap::new(),
        };
        Self {
            nodes: vec![Some(node)],
            free: Vec::new(),
            root: NodeId(0),
            len: 1,
        }
    }

    /// Build a mirror from a flat snapshot
    ///
    /// Returns `None` when the snapshot does not contain `root`. Entries whose
    /// parent is absent are skipped.
    pub fn from_snapshot(root: &Path, snapshot: &Snapshot) -> Option<Self> {
        let mut tree = Self::new(root.to_path_buf(), snapshot.get(root)?.clone());
        for (path, state) in snapshot.sorted() {
            if path != root {
                tree.upsert(path, state.clone());
            }
        }
        Some(tree)
    }

    pub fn root(&self) -> &TreeNode {
        self.node_ref(self.root)
    }

    pub fn root_path(&self) -> &Path {
        &self.root().path
    }

    /// Number of live nodes, root included
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn node(&self, id: NodeId) -> Option<&TreeNode> {
        self.nodes.get(id.0).and_then(Option::as_ref)
    }

    pub fn lookup(&self, path: &Path) -> Option<NodeId> {
        let rel = path.strip_prefix(self.root_path()).ok()?;
        let mut current = self.root;
        for component in rel.components() {
            match component {
                Component::Normal(name) => {
                    current = *self.node(current)?.children.get(name)?;
                }
                _ => return None,
            }
        }
        Some(current)
    }

    pub fn get(&self, path: &Path) -> Option<&TreeNode> {
        self.lookup(path).and_then(|id| self.node(id))
    }

    pub fn state(&self, path: &Path) -> Option<&FileState> {
        self.get(path).map(|node| &node.state)
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.lookup(path).is_some()
    }

    /// Insert or update one node
    ///
    /// Returns `None` when the parent is not mirrored. A node that stops
    /// being a directory loses its children.
    pub fn upsert(&mut self, path: &Path, state: FileState) -> Option<NodeId> {
        if let Some(id) = self.lookup(path) {
            let drop_children = !state.kind.is_dir();
            self.node_mut(id).state = state;
            if drop_children {
                let children: Vec<NodeId> = self.node_ref(id).children().collect();
                self.node_mut(id).children.clear();
                for child in children {
                    self.release_subtree(child);
                }
            }
            return Some(id);
        }

        let parent = self.lookup(path.parent()?)?;
        let name = path.file_name()?.to_os_string();
        let id = self.alloc(TreeNode {
            path: path.to_path_buf(),
            state,
            parent: Some(parent),
            children: BTreeMap::new(),
        });
        self.node_mut(parent).children.insert(name, id);
        Some(id)
    }

    /// Remove a node and its subtree, returning what was removed parents first
    ///
    /// The root itself is never removed.
    pub fn remove(&mut self, path: &Path) -> Vec<(PathBuf, FileState)> {
        let Some(id) = self.lookup(path) else {
            return Vec::new();
        };
        if id == self.root {
            return Vec::new();
        }
        self.detach(id);
        let ids = self.descendants(id);
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(node) = self.nodes[id.0].take() {
                removed.push((node.path, node.state));
                self.free.push(id);
                self.len -= 1;
            }
        }
        removed
    }

    /// Move a node (and its subtree) to a new path
    ///
    /// An existing node at `to` is replaced. Fails when `from` is unknown,
    /// either side is the root, the destination parent is unknown, or one
    /// path contains the other.
    pub fn move_node(&mut self, from: &Path, to: &Path) -> bool {
        let Some(id) = self.lookup(from) else {
            return false;
        };
        if id == self.root || to == self.root_path() || to.starts_with(from) || from.starts_with(to) {
            return false;
        }
        let (Some(new_parent), Some(name)) = (to.parent().and_then(|p| self.lookup(p)), to.file_name())
        else {
            return false;
        };
        let name = name.to_os_string();

        self.remove(to);
        self.detach(id);
        self.node_mut(new_parent).children.insert(name, id);
        self.node_mut(id).parent = Some(new_parent);

        for node_id in self.descendants(id) {
            let node = self.node_mut(node_id);
            if let Ok(rel) = node.path.strip_prefix(from) {
                node.path = to.join(rel);
            }
        }
        true
    }

    /// Flat snapshot of `subtree` (empty when unknown)
    pub fn snapshot(&self, subtree: &Path) -> Snapshot {
        let Some(id) = self.lookup(subtree) else {
            return Snapshot::new();
        };
        self.descendants(id)
            .into_iter()
            .map(|id| {
                let node = self.node_ref(id);
                (node.path.clone(), node.state.clone())
            })
            .collect()
    }

    /// Replace `subtree` with freshly scanned contents
    ///
    /// Replacing the root rebuilds the whole arena.
    pub fn replace_subtree(&mut self, subtree: &Path, fresh: &Snapshot) {
        if subtree == self.root_path() {
            if let Some(rebuilt) = Self::from_snapshot(subtree, fresh) {
                *self = rebuilt;
            }
            return;
        }
        self.remove(subtree);
        for (path, state) in fresh.sorted() {
            if path.starts_with(subtree) {
                self.upsert(path, state.clone());
            }
        }
    }

    /// Every mirrored directory, root included when it is one
    pub fn directories(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = self
            .nodes
            .iter()
            .flatten()
            .filter(|node| node.is_dir())
            .map(|node| node.path.clone())
            .collect();
        dirs.sort();
        dirs
    }

    /// Pre-order walk of `id` and everything below it
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            if let Some(node) = self.node(next) {
                out.push(next);
                stack.extend(node.children.values().rev().copied());
            }
        }
        out
    }

    fn detach(&mut self, id: NodeId) {
        let node = self.node_ref(id);
        let (parent, name) = (node.parent, node.path.file_name().map(|n| n.to_os_string()));
        if let (Some(parent), Some(name)) = (parent, name) {
            if let Some(Some(parent)) = self.nodes.get_mut(parent.0) {
                parent.children.remove(&name);
            }
        }
    }

    fn release_subtree(&mut self, id: NodeId) {
        for id in self.descendants(id) {
            if self.nodes[id.0].take().is_some() {
                self.free.push(id);
                self.len -= 1;
            }
        }
    }

    fn alloc(&mut self, node: TreeNode) -> NodeId {
        self.len += 1;
        match self.free.pop() {
            Some(id) => {
                self.nodes[id.0] = Some(node);
                id
            }
            None => {
                self.nodes.push(Some(node));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    // Ids handed out by this arena always point at live slots until released.
    fn node_ref(&self, id: NodeId) -> &TreeNode {
        match &self.nodes[id.0] {
            Some(node) => node,
            None => unreachable!("dangling node id {}", id.0),
        }
    }

    fn node_mut(&mut self, id: NodeId) -> &mut TreeNode {
        match &mut self.nodes[id.0] {
            Some(node) => node,
            None => unreachable!("dangling node id {}", id.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::tests::{dir, file};

    fn sample() -> DirTree {
        let mut tree = DirTree::new(PathBuf::from("/r"), dir(1));
        tree.upsert(Path::new("/r/a"), dir(2)).unwrap();
        tree.upsert(Path::new("/r/a/x.txt"), file(3, 3)).unwrap();
        tree.upsert(Path::new("/r/a/sub"), dir(4)).unwrap();
        tree.upsert(Path::new("/r/a/sub/y.txt"), file(5, 5)).unwrap();
        tree.upsert(Path::new("/r/top.txt"), file(6, 6)).unwrap();
        tree
    }

    #[test]
    fn test_upsert_requires_known_parent() {
        let mut tree = sample();
        assert!(tree.upsert(Path::new("/r/missing/z"), file(1, 9)).is_none());
        assert!(tree.upsert(Path::new("/elsewhere/z"), file(1, 9)).is_none());
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_remove_returns_subtree_parents_first() {
        let mut tree = sample();
        let removed: Vec<PathBuf> = tree.remove(Path::new("/r/a")).into_iter().map(|(p, _)| p).collect();
        assert_eq!(removed[0], PathBuf::from("/r/a"));
        assert_eq!(removed.len(), 4);
        assert_eq!(tree.len(), 2);
        assert!(!tree.contains(Path::new("/r/a/sub/y.txt")));
        assert!(tree.remove(Path::new("/r")).is_empty());
    }

    #[test]
    fn test_freed_slots_are_reused() {
        let mut tree = sample();
        tree.remove(Path::new("/r/a"));
        let slots = tree.nodes.len();
        tree.upsert(Path::new("/r/b"), dir(7)).unwrap();
        tree.upsert(Path::new("/r/b/c"), file(1, 8)).unwrap();
        assert_eq!(tree.nodes.len(), slots);
    }

    #[test]
    fn test_move_rewrites_descendant_paths() {
        let mut tree = sample();
        assert!(tree.move_node(Path::new("/r/a"), Path::new("/r/b")));

        assert!(!tree.contains(Path::new("/r/a")));
        let moved = tree.get(Path::new("/r/b/sub/y.txt")).unwrap();
        assert_eq!(moved.path, PathBuf::from("/r/b/sub/y.txt"));
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_move_replaces_destination() {
        let mut tree = sample();
        assert!(tree.move_node(Path::new("/r/a/x.txt"), Path::new("/r/top.txt")));
        assert_eq!(tree.state(Path::new("/r/top.txt")).unwrap().size, 3);
        assert_eq!(tree.len(), 5);
    }

    #[test]
    fn test_move_into_own_subtree_is_refused() {
        let mut tree = sample();
        assert!(!tree.move_node(Path::new("/r/a"), Path::new("/r/a/sub/a")));
        assert!(!tree.move_node(Path::new("/r/nope"), Path::new("/r/b")));
    }

    #[test]
    fn test_file_replacing_directory_drops_children() {
        let mut tree = sample();
        tree.upsert(Path::new("/r/a"), file(1, 2)).unwrap();
        assert!(!tree.contains(Path::new("/r/a/x.txt")));
        assert_eq!(tree.len(), 3);
    }

    #[test]
    fn test_replace_subtree_and_root() {
        let mut tree = sample();
        let fresh: Snapshot = [
            (PathBuf::from("/r/a"), dir(2)),
            (PathBuf::from("/r/a/fresh.txt"), file(1, 10)),
        ]
        .into_iter()
        .collect();
        tree.replace_subtree(Path::new("/r/a"), &fresh);
        assert!(tree.contains(Path::new("/r/a/fresh.txt")));
        assert!(!tree.contains(Path::new("/r/a/sub")));
        assert!(tree.contains(Path::new("/r/top.txt")));

        let root_only: Snapshot = [(PathBuf::from("/r"), dir(1))].into_iter().collect();
        tree.replace_subtree(Path::new("/r"), &root_only);
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_snapshot_roundtrip_keeps_structure() {
        let tree = sample();
        let snapshot = tree.snapshot(Path::new("/r"));
        assert_eq!(snapshot.len(), 6);

        let rebuilt = DirTree::from_snapshot(Path::new("/r"), &snapshot).unwrap();
        assert_eq!(rebuilt.directories(), tree.directories());
        assert!(DirTree::from_snapshot(Path::new("/other"), &snapshot).is_none());
    }
}
