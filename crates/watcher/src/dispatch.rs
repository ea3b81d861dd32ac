//! Event fan-out to consumers
//!
//! Every subscriber owns a bounded queue. Publishing never blocks: a full
//! queue drops its oldest unread event and counts the drop. Consumers either
//! pull from a `Subscription` or hand the dispatcher an `AlertChannel`,
//! which gets its own drain task on the tokio runtime.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use vigil_core::ChangeEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// A push-style consumer (console, log file, mail relay...)
///
/// Delivery failures are logged and the event is skipped; nothing is retried.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one event; `dropped` is the channel's running drop count
    async fn deliver(&self, event: &ChangeEvent, dropped: u64) -> anyhow::Result<()>;
}

#[derive(Debug)]
struct ConsumerQueue {
    events: Mutex<VecDeque<ChangeEvent>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    ready: Notify,
}

impl ConsumerQueue {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ready: Notify::new(),
        }
    }

    fn push(&self, event: ChangeEvent) {
        {
            let mut events = self.events.lock();
            if events.len() >= self.capacity {
                events.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.ready.notify_one();
    }

    fn pop(&self) -> Option<ChangeEvent> {
        self.events.lock().pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.ready.notify_waiters();
        // A receiver between its empty check and `notified()` still wakes
        self.ready.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Pull-style consumer handle
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    queue: Arc<ConsumerQueue>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next queued event, if any
    pub fn try_recv(&self) -> Option<ChangeEvent> {
        self.queue.pop()
    }

    /// Wait for the next event; `None` once unsubscribed and drained
    pub async fn recv(&self) -> Option<ChangeEvent> {
        loop {
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            if self.queue.is_closed() {
                return None;
            }
            self.queue.ready.notified().await;
        }
    }

    /// Events dropped from this queue so far
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.queue.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take everything queued right now
    pub fn drain(&self) -> Vec<ChangeEvent> {
        self.queue.events.lock().drain(..).collect()
    }
}

#[derive(Debug)]
pub struct Dispatcher {
    subscribers: DashMap<SubscriptionId, Arc<ConsumerQueue>>,
    next_id: AtomicU64,
    default_capacity: usize,
    published: AtomicU64,
    /// Publishers take turns so every consumer sees one global order
    order: Mutex<()>,
}

impl Dispatcher {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(1),
            default_capacity,
            published: AtomicU64::new(0),
            order: Mutex::new(()),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        self.subscribe_with_capacity(self.default_capacity)
    }

    pub fn subscribe_with_capacity(&self, capacity: usize) -> Subscription {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let queue = Arc::new(ConsumerQueue::new(capacity));
        self.subscribers.insert(id, queue.clone());
        debug!(%id, capacity = queue.capacity, "subscriber added");
        Subscription { id, queue }
    }

    /// Attach a push-style channel drained by a task on `handle`
    pub fn subscribe_channel(
        &self,
        channel: Arc<dyn AlertChannel>,
        handle: &tokio::runtime::Handle,
    ) -> SubscriptionId {
        let subscription = self.subscribe();
        let id = subscription.id();
        handle.spawn(async move {
            while let Some(event) = subscription.recv().await {
                if let Err(err) = channel.deliver(&event, subscription.dropped()).await {
                    warn!(channel = channel.name(), "alert delivery failed: {err:#}");
                }
            }
            debug!(channel = channel.name(), "alert channel drained");
        });
        id
    }

    /// Close a subscriber's queue; its receiver drains what is left
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, queue)) => {
                queue.close();
                true
            }
            None => false,
        }
    }

    /// Hand `event` to every subscriber without blocking
    pub fn publish(&self, event: &ChangeEvent) {
        let _turn = self.order.lock();
        // Snapshot the queues so no shard lock is held while pushing
        let queues: Vec<Arc<ConsumerQueue>> = self.subscribers.iter().map(|q| q.value().clone()).collect();
        for queue in queues {
            queue.push(event.clone());
        }
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dropped(&self, id: SubscriptionId) -> Option<u64> {
        self.subscribers.get(&id).map(|q| q.dropped.load(Ordering::Relaxed))
    }

    /// Drop counters for every live subscriber
    pub fn drop_counts(&self) -> Vec<(SubscriptionId, u64)> {
        let mut counts: Vec<_> = self
            .subscribers
            .iter()
            .map(|q| (*q.key(), q.dropped.load(Ordering::Relaxed)))
            .collect();
        counts.sort();
        counts
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn close_all(&self) {
        let ids: Vec<SubscriptionId> = self.subscribers.iter().map(|q| *q.key()).collect();
        for id in ids {
            self.unsubscribe(id);
        }
    }
}
