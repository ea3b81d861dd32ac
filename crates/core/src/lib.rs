//! Core data model for Vigil
//!
//! This crate provides:
//! - Watch target and change event types shared by every pipeline stage
//! - File state snapshots and snapshot diffing
//! - The arena-backed directory mirror
//! - BLAKE3 content hashing for same-size rewrite detection
//! - The engine's error taxonomy

pub mod error;
pub mod event;
pub mod hash;
pub mod mirror;
pub mod tree;

pub use error::{Result, WatchError};
pub use event::{BackendKind, ChangeEvent, ChangeKind, WatchTarget, WatchTargetId};
pub use hash::ContentHash;
pub use mirror::{DirTree, NodeId, TreeNode};
pub use tree::{EntryKind, FileIdentity, FileState, Snapshot, TreeDiff};
