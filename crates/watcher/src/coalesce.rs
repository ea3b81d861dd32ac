//! Per-path coalescing window
//!
//! Buffers observations per path, slides each path's deadline on new
//! activity (bounded by the hard cap), and reduces a closed burst to at
//! most one semantic change:
//!
//! | existed before | exists after | emitted                         |
//! |----------------|--------------|---------------------------------|
//! | no             | yes          | Created                         |
//! | no             | no           | nothing                         |
//! | yes            | no           | Deleted                         |
//! | yes            | yes          | Modified, or AttributesChanged  |
//!
//! "Existed before" means the mirror held the path, so a create on a known
//! path is a replace, and a write to a path the mirror never saw (its create
//! lost to an overflow) is a creation. Delete and create halves that are
//! pending together are paired into a rename by cookie or file identity;
//! more than one plausible partner means no pairing. A child path never
//! closes while one of its ancestors still has a pending burst.

use crate::debounce::{DeadlineQueue, Window};
use crate::normalize::{Change, Observation};
use dashmap::DashMap;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime};
use tracing::{debug, trace};
use vigil_core::{ChangeKind, FileState, WatchTargetId};

/// State lookups the window needs while closing bursts
pub trait Resolver {
    /// What the mirror held for `path` before its burst (the pre-burst state)
    fn known(&self, path: &Path) -> Option<FileState>;

    /// What is on disk at `path` right now
    fn current(&self, path: &Path) -> Option<FileState>;
}

/// Net outcome of one path's burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Created,
    Modified,
    Deleted,
    AttributesChanged,
}

impl From<Outcome> for ChangeKind {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Created => ChangeKind::Created,
            Outcome::Modified => ChangeKind::Modified,
            Outcome::Deleted => ChangeKind::Deleted,
            Outcome::AttributesChanged => ChangeKind::AttributesChanged,
        }
    }
}

/// Reduce a path's ordered changes to their net outcome
///
/// `known_before` says whether the mirror held the path when the burst
/// began; that alone decides whether it existed before. Returns `None` when
/// the burst nets out to nothing.
pub fn reduce(changes: &[Change], known_before: bool) -> Option<Outcome> {
    if changes.is_empty() {
        return None;
    }
    let existed_before = known_before;

    let mut exists = existed_before;
    let mut churned = false;
    let mut content = false;
    for change in changes {
        match change {
            Change::Create => {
                exists = true;
                churned = true;
            }
            Change::Delete => {
                exists = false;
                churned = true;
            }
            Change::Modify => {
                exists = true;
                content = true;
            }
            Change::Attributes => exists = true,
        }
    }

    match (existed_before, exists) {
        (false, true) => Some(Outcome::Created),
        (false, false) => None,
        (true, false) => Some(Outcome::Deleted),
        (true, true) if churned || content => Some(Outcome::Modified),
        (true, true) => Some(Outcome::AttributesChanged),
    }
}

/// A closed burst, ready to be applied and published
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Emission {
    /// Affected path (the destination for renames)
    pub path: PathBuf,
    pub kind: ChangeKind,
    /// Every target that observed part of the burst
    pub targets: SmallVec<[WatchTargetId; 2]>,
    pub occurred_at: SystemTime,
}

#[derive(Debug, Clone)]
struct PendingBurst {
    changes: SmallVec<[Change; 4]>,
    targets: SmallVec<[WatchTargetId; 2]>,
    cookie: Option<usize>,
    first_seen: Instant,
    deadline: Instant,
    occurred_at: SystemTime,
}

impl PendingBurst {
    fn new(now: Instant, occurred_at: SystemTime) -> Self {
        Self {
            changes: SmallVec::new(),
            targets: SmallVec::new(),
            cookie: None,
            first_seen: now,
            deadline: now,
            occurred_at,
        }
    }

    fn record(&mut self, obs: &Observation, now: Instant, window: &Window) {
        self.changes.push(obs.change);
        if !self.targets.contains(&obs.target) {
            self.targets.push(obs.target);
        }
        if obs.cookie.is_some() {
            self.cookie = obs.cookie;
        }
        self.occurred_at = self.occurred_at.max(obs.observed_at);
        self.deadline = window.deadline(self.first_seen, now);
    }

    fn merge(&mut self, other: PendingBurst) {
        self.changes.extend(other.changes);
        for target in other.targets {
            if !self.targets.contains(&target) {
                self.targets.push(target);
            }
        }
        self.cookie = self.cookie.or(other.cookie);
        self.first_seen = self.first_seen.min(other.first_seen);
        self.deadline = self.deadline.max(other.deadline);
        self.occurred_at = self.occurred_at.max(other.occurred_at);
    }

    fn contains(&self, change: Change) -> bool {
        self.changes.contains(&change)
    }

    fn opens_with_create(&self) -> bool {
        self.changes.first() == Some(&Change::Create)
    }

    /// Whether content was written after the last create
    fn modified_after_create(&self) -> bool {
        match self.changes.iter().rposition(|c| *c == Change::Create) {
            Some(i) => self.changes[i + 1..].contains(&Change::Modify),
            None => false,
        }
    }

    fn emission(&self, path: PathBuf, kind: ChangeKind) -> Emission {
        Emission {
            path,
            kind,
            targets: self.targets.clone(),
            occurred_at: self.occurred_at,
        }
    }
}

pub struct Coalescer {
    window: Window,
    pending: DashMap<PathBuf, PendingBurst>,
    deadlines: DeadlineQueue,
}

impl Coalescer {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            pending: DashMap::new(),
            deadlines: DeadlineQueue::new(),
        }
    }

    pub fn window(&self) -> Window {
        self.window
    }

    /// Add an observation to its path's burst, opening one if needed
    pub fn push(&self, obs: Observation, now: Instant) {
        let deadline = {
            let mut burst = self
                .pending
                .entry(obs.path.clone())
                .or_insert_with(|| PendingBurst::new(now, obs.observed_at));
            burst.record(&obs, now, &self.window);
            burst.deadline
        };
        self.deadlines.schedule(obs.path, deadline);
    }

    pub fn is_pending(&self, path: &Path) -> bool {
        self.pending.contains_key(path)
    }

    /// Number of open bursts
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// When the pipeline should next call `collect_ready`
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.next_deadline()
    }

    /// Close every burst whose deadline has passed
    pub fn collect_ready(&self, now: Instant, resolver: &dyn Resolver) -> Vec<Emission> {
        let due: Vec<PathBuf> = self.deadlines.pop_due(now).into_iter().map(|(_, p)| p).collect();
        if due.is_empty() {
            return Vec::new();
        }
        self.close(due, now, resolver, false)
    }

    /// Close every open burst regardless of deadlines
    pub fn flush(&self, resolver: &dyn Resolver) -> Vec<Emission> {
        let mut emissions = Vec::new();
        // Directory renames can re-key child bursts, so repeat until empty
        while !self.pending.is_empty() {
            self.deadlines.clear();
            let mut open: Vec<PathBuf> = self.pending.iter().map(|e| e.key().clone()).collect();
            open.sort();
            emissions.extend(self.close(open, Instant::now(), resolver, true));
        }
        emissions
    }

    /// Drop `target`'s share of every burst; returns how many bursts died
    ///
    /// Bursts another target also observed stay open.
    pub fn discard_target(&self, target: WatchTargetId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, burst| {
            burst.targets.retain(|t| *t != target);
            !burst.targets.is_empty()
        });
        before - self.pending.len()
    }

    /// Like `discard_target`, limited to bursts at or under `subtree`
    pub fn discard_under(&self, target: WatchTargetId, subtree: &Path) -> usize {
        let before = self.pending.len();
        self.pending.retain(|path, burst| {
            if !path.starts_with(subtree) {
                return true;
            }
            burst.targets.retain(|t| *t != target);
            !burst.targets.is_empty()
        });
        before - self.pending.len()
    }

    fn close(&self, paths: Vec<PathBuf>, now: Instant, resolver: &dyn Resolver, force: bool) -> Vec<Emission> {
        let mut queue: VecDeque<(PathBuf, bool)> = paths.into_iter().map(|p| (p, force)).collect();
        let mut emissions = Vec::new();

        while let Some((path, forced)) = queue.pop_front() {
            // 1. Skip stale entries: already closed, or slid past `now`
            let Some((deadline, cap)) = self
                .pending
                .get(&path)
                .map(|b| (b.deadline, b.first_seen + self.window.hard_cap))
            else {
                continue;
            };
            if !forced && deadline > now {
                continue;
            }

            // 2. Outermost pending ancestor closes first. A burst at its hard
            // cap drags its ancestors along instead of waiting for them.
            if let Some((ancestor, ancestor_deadline)) = self.outermost_pending_ancestor(&path) {
                let capped = cap <= now;
                if forced || capped || ancestor_deadline <= now {
                    queue.push_front((path, forced || capped));
                    queue.push_front((ancestor, forced || capped));
                } else {
                    trace!("{} waits for {}", path.display(), ancestor.display());
                    self.deadlines.schedule(path, ancestor_deadline.min(cap));
                }
                continue;
            }

            // 3. Close
            if let Some((path, burst)) = self.pending.remove(&path) {
                self.close_burst(path, burst, resolver, &mut emissions);
            }
        }
        emissions
    }

    fn close_burst(&self, path: PathBuf, burst: PendingBurst, resolver: &dyn Resolver, out: &mut Vec<Emission>) {
        let known = resolver.known(&path);
        let Some(outcome) = reduce(&burst.changes, known.is_some()) else {
            trace!("burst on {} netted out", path.display());
            return;
        };

        match outcome {
            Outcome::Deleted => {
                match self.take_partner(&path, &burst, known.as_ref(), Outcome::Created, resolver) {
                    Some((to, dest)) => {
                        let is_dir = known.as_ref().is_some_and(|s| s.kind.is_dir());
                        self.rename(path, to, burst, dest, is_dir, resolver, out);
                    }
                    None => {
                        if known.as_ref().is_some_and(|s| s.kind.is_dir()) {
                            let absorbed = self.absorb_under(&path);
                            if absorbed > 0 {
                                trace!(absorbed, "children folded into deletion of {}", path.display());
                            }
                        }
                        out.push(burst.emission(path, ChangeKind::Deleted));
                    }
                }
            }
            Outcome::Created => {
                let current = resolver.current(&path);
                match self.take_partner(&path, &burst, current.as_ref(), Outcome::Deleted, resolver) {
                    Some((from, source)) => {
                        let is_dir = current.as_ref().is_some_and(|s| s.kind.is_dir());
                        self.rename(from, path, source, burst, is_dir, resolver, out);
                    }
                    None => out.push(burst.emission(path, ChangeKind::Created)),
                }
            }
            Outcome::Modified => {
                // A create for something the mirror already holds unchanged,
                // e.g. late events for a file a rescan has already recorded
                if burst.opens_with_create() {
                    if let (Some(before), Some(now)) = (known.as_ref(), resolver.current(&path)) {
                        if !before.content_differs(&now) && !before.attributes_differ(&now) {
                            trace!("duplicate create for {}", path.display());
                            return;
                        }
                    }
                }
                out.push(burst.emission(path, ChangeKind::Modified));
            }
            Outcome::AttributesChanged => out.push(burst.emission(path, ChangeKind::AttributesChanged)),
        }
    }

    /// Find and remove the one pending burst that completes a rename
    ///
    /// `own` is the identity of the closing side: its mirror state when it
    /// was deleted, its disk state when it was created.
    fn take_partner(
        &self,
        path: &Path,
        burst: &PendingBurst,
        own: Option<&FileState>,
        wanted: Outcome,
        resolver: &dyn Resolver,
    ) -> Option<(PathBuf, PendingBurst)> {
        let marker = match wanted {
            Outcome::Created => Change::Create,
            _ => Change::Delete,
        };

        // Copy candidates out so no shard lock is held across stat calls
        let candidates: Vec<(PathBuf, SmallVec<[Change; 4]>, Option<usize>)> = self
            .pending
            .iter()
            .filter(|e| e.key() != path && e.value().contains(marker))
            .map(|e| (e.key().clone(), e.value().changes.clone(), e.value().cookie))
            .collect();

        let mut by_cookie: SmallVec<[PathBuf; 1]> = SmallVec::new();
        let mut by_identity: SmallVec<[PathBuf; 1]> = SmallVec::new();
        for (candidate, changes, cookie) in candidates {
            let candidate_known = resolver.known(&candidate);
            if reduce(&changes, candidate_known.is_some()) != Some(wanted) {
                continue;
            }
            if burst.cookie.is_some() && cookie == burst.cookie {
                by_cookie.push(candidate);
                continue;
            }
            let other = match wanted {
                Outcome::Created => resolver.current(&candidate),
                _ => candidate_known,
            };
            if let (Some(own), Some(other)) = (own, other) {
                if own.same_file(&other) {
                    by_identity.push(candidate);
                }
            }
        }

        let chosen = match (by_cookie.len(), by_identity.len()) {
            (1, _) => by_cookie.pop(),
            (0, 1) => by_identity.pop(),
            (0, 0) => None,
            (cookies, identities) => {
                debug!(cookies, identities, "ambiguous rename partner for {}", path.display());
                None
            }
        };
        chosen.and_then(|p| self.pending.remove(&p))
    }

    #[allow(clippy::too_many_arguments)]
    fn rename(
        &self,
        from: PathBuf,
        to: PathBuf,
        source: PendingBurst,
        dest: PendingBurst,
        is_dir: bool,
        resolver: &dyn Resolver,
        out: &mut Vec<Emission>,
    ) {
        let mut targets = source.targets.clone();
        for target in &dest.targets {
            if !targets.contains(target) {
                targets.push(*target);
            }
        }
        out.push(Emission {
            path: to.clone(),
            kind: ChangeKind::Renamed {
                from: from.clone(),
                to: to.clone(),
            },
            targets,
            occurred_at: source.occurred_at.max(dest.occurred_at),
        });
        if dest.modified_after_create() {
            out.push(dest.emission(to.clone(), ChangeKind::Modified));
        }
        if is_dir {
            self.remap_children(&from, &to, resolver);
        }
    }

    /// Re-key child bursts from a renamed directory to its new location
    ///
    /// A child deleted under the old name and created under the new one is
    /// the directory move itself and disappears.
    fn remap_children(&self, from: &Path, to: &Path, resolver: &dyn Resolver) {
        let moved: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|e| e.key().starts_with(from))
            .map(|e| e.key().clone())
            .collect();

        for old in moved {
            let Some((_, burst)) = self.pending.remove(&old) else {
                continue;
            };
            let Ok(rel) = old.strip_prefix(from) else {
                continue;
            };
            let new = to.join(rel);
            let old_outcome = reduce(&burst.changes, resolver.known(&old).is_some());

            match self.pending.remove(&new) {
                Some((_, counterpart)) => {
                    let new_outcome = reduce(&counterpart.changes, resolver.known(&new).is_some());
                    if old_outcome == Some(Outcome::Deleted) && new_outcome == Some(Outcome::Created) {
                        trace!("{} moved with its directory", new.display());
                        continue;
                    }
                    let mut merged = burst;
                    merged.merge(counterpart);
                    self.reinsert(new, merged);
                }
                None => self.reinsert(new, burst),
            }
        }
    }

    /// Drop every burst strictly below `dir`
    fn absorb_under(&self, dir: &Path) -> usize {
        let before = self.pending.len();
        self.pending.retain(|path, _| path == dir || !path.starts_with(dir));
        before - self.pending.len()
    }

    fn reinsert(&self, path: PathBuf, burst: PendingBurst) {
        let deadline = burst.deadline;
        self.pending.insert(path.clone(), burst);
        self.deadlines.schedule(path, deadline);
    }

    fn outermost_pending_ancestor(&self, path: &Path) -> Option<(PathBuf, Instant)> {
        let mut found = None;
        for ancestor in path.ancestors().skip(1) {
            if let Some(burst) = self.pending.get(ancestor) {
                found = Some((ancestor.to_path_buf(), burst.deadline));
            }
        }
        found
    }
}
