//! Per-path deadline scheduling
//!
//! One min-heap of (deadline, path) entries stands in for per-path timers.
//! Entries are never updated in place: sliding a deadline pushes a fresh
//! entry, and stale ones are skipped by the coalescer when popped.

use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Sliding window bounds for a burst
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub interval: Duration,
    pub hard_cap: Duration,
}

impl Window {
    pub fn new(interval: Duration, hard_cap: Duration) -> Self {
        Self {
            interval,
            hard_cap: hard_cap.max(interval),
        }
    }

    /// Close time for a burst first seen at `first_seen`, last touched at `last_seen`
    pub fn deadline(&self, first_seen: Instant, last_seen: Instant) -> Instant {
        (last_seen + self.interval).min(first_seen + self.hard_cap)
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Scheduled {
    deadline: Instant,
    seq: u64,
    path: PathBuf,
}

#[derive(Debug, Default)]
pub struct DeadlineQueue {
    inner: Mutex<Heap>,
}

#[derive(Debug, Default)]
struct Heap {
    entries: BinaryHeap<Reverse<Scheduled>>,
    seq: u64,
}

impl DeadlineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&self, path: PathBuf, deadline: Instant) {
        let mut heap = self.inner.lock();
        heap.seq += 1;
        let seq = heap.seq;
        heap.entries.push(Reverse(Scheduled { deadline, seq, path }));
    }

    /// Earliest scheduled deadline, possibly stale
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner.lock().entries.peek().map(|Reverse(s)| s.deadline)
    }

    /// Pop every entry due at `now`, earliest first
    pub fn pop_due(&self, now: Instant) -> Vec<(Instant, PathBuf)> {
        let mut heap = self.inner.lock();
        let mut due = Vec::new();
        while heap.entries.peek().is_some_and(|Reverse(s)| s.deadline <= now) {
            if let Some(Reverse(s)) = heap.entries.pop() {
                due.push((s.deadline, s.path));
            }
        }
        due
    }

    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_slides_until_hard_cap() {
        let window = Window::new(Duration::from_millis(300), Duration::from_secs(5));
        let t0 = Instant::now();

        assert_eq!(window.deadline(t0, t0), t0 + Duration::from_millis(300));
        assert_eq!(
            window.deadline(t0, t0 + Duration::from_secs(2)),
            t0 + Duration::from_millis(2300)
        );
        assert_eq!(window.deadline(t0, t0 + Duration::from_secs(6)), t0 + Duration::from_secs(5));
    }

    #[test]
    fn test_hard_cap_never_below_interval() {
        let window = Window::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(window.hard_cap, Duration::from_millis(500));
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let queue = DeadlineQueue::new();
        let t0 = Instant::now();
        queue.schedule(PathBuf::from("/late"), t0 + Duration::from_millis(30));
        queue.schedule(PathBuf::from("/early"), t0 + Duration::from_millis(10));
        queue.schedule(PathBuf::from("/later"), t0 + Duration::from_secs(10));

        assert_eq!(queue.next_deadline(), Some(t0 + Duration::from_millis(10)));
        let due: Vec<PathBuf> = queue
            .pop_due(t0 + Duration::from_millis(50))
            .into_iter()
            .map(|(_, p)| p)
            .collect();
        assert_eq!(due, vec![PathBuf::from("/early"), PathBuf::from("/late")]);
        assert_eq!(queue.len(), 1);
    }
}
