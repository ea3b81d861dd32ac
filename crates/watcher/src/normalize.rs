//! Raw event normalization
//!
//! Stateless mapping from backend-specific raw events to canonical
//! observations. Rename halves become a delete and a create here; pairing
//! them back up happens in the coalescing window, where both halves and the
//! mirror are visible.

use crate::platform::{PollDelta, RawAction, RawEvent};
use notify::event::{MetadataKind, ModifyKind, RenameMode};
use notify::EventKind;
use std::path::PathBuf;
use std::time::SystemTime;
use vigil_core::WatchTargetId;

/// Canonical change observed on one path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Change {
    Create,
    Modify,
    Attributes,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub target: WatchTargetId,
    pub path: PathBuf,
    pub change: Change,
    pub cookie: Option<usize>,
    pub observed_at: SystemTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Normalized {
    Change(Observation),
    /// The subtree at `path` must be rescanned
    Rescan { target: WatchTargetId, path: PathBuf },
    RootLost { target: WatchTargetId, path: PathBuf },
    /// Carries no change (access events, atime updates)
    Ignored,
}

pub fn normalize(raw: RawEvent) -> Normalized {
    let change = match &raw.action {
        RawAction::Overflow => {
            return Normalized::Rescan {
                target: raw.target,
                path: raw.path,
            }
        }
        RawAction::RootLost => {
            return Normalized::RootLost {
                target: raw.target,
                path: raw.path,
            }
        }
        RawAction::Native(kind) => match native_change(kind) {
            Some(change) => change,
            None => return Normalized::Ignored,
        },
        RawAction::Polled(delta) => polled_change(*delta),
    };

    Normalized::Change(Observation {
        target: raw.target,
        path: raw.path,
        change,
        cookie: raw.cookie,
        observed_at: raw.observed_at,
    })
}

fn native_change(kind: &EventKind) -> Option<Change> {
    match kind {
        EventKind::Access(_) => None,
        EventKind::Create(_) => Some(Change::Create),
        EventKind::Remove(_) => Some(Change::Delete),
        EventKind::Modify(ModifyKind::Metadata(MetadataKind::AccessTime)) => None,
        EventKind::Modify(ModifyKind::Metadata(_)) => Some(Change::Attributes),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(Change::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(Change::Create),
        // Unknown kinds are reported as modifications, never dropped
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(Change::Modify),
    }
}

fn polled_change(delta: PollDelta) -> Change {
    match delta {
        PollDelta::Appeared => Change::Create,
        PollDelta::Vanished => Change::Delete,
        PollDelta::Changed => Change::Modify,
        PollDelta::AttributesChanged => Change::Attributes,
    }
}
