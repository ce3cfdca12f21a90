//! Event Bus (Section 4.4): a per-process registry of bounded,
//! per-subscriber queues, fanning events out by `run_id`.
//!
//! Producer contract: `publish` never blocks and never fails because a
//! subscriber is slow. When a subscriber's queue is full we drop the
//! **oldest** queued event for that subscriber (documented choice: a live
//! tail is more useful to an attached observer than a stale backlog) and
//! bump its `dropped` counter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use alpine_core::events::Event;
use alpine_core::types::RunId;

struct Subscriber {
    queue: Mutex<VecDeque<Event>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

/// A handle to one subscription. Dropping it unsubscribes.
pub struct Subscription {
    bus: Arc<EventBusInner>,
    run_id: RunId,
    id: u64,
    subscriber: Arc<Subscriber>,
}

impl Subscription {
    /// Await the next event, or `None` once the subscription has been
    /// closed (run terminated and retention elapsed, or bus shutdown).
    pub async fn recv(&self) -> Option<Event> {
        loop {
            {
                let mut queue = self.subscriber.queue.lock().unwrap();
                if let Some(event) = queue.pop_front() {
                    return Some(event);
                }
                if self.subscriber.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.subscriber.notify.notified().await;
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.subscriber.dropped.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.subscriber.closed.store(true, Ordering::Release);
        self.subscriber.notify.notify_waiters();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.run_id, self.id);
    }
}

struct EventBusInner {
    capacity: usize,
    max_per_run: usize,
    subscribers: Mutex<HashMap<RunId, Vec<(u64, Arc<Subscriber>)>>>,
    next_id: AtomicU64,
    published_total: AtomicU64,
}

impl EventBusInner {
    fn unsubscribe(&self, run_id: RunId, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(&run_id) {
            list.retain(|(sid, _)| *sid != id);
            if list.is_empty() {
                subscribers.remove(&run_id);
            }
        }
    }
}

/// Error returned when a run already has `max_clients_per_run` active
/// subscriptions.
#[derive(Debug, thiserror::Error)]
#[error("too many subscribers for run {0}")]
pub struct TooManySubscribers(pub RunId);

#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new(capacity: usize, max_per_run: usize) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                capacity,
                max_per_run,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                published_total: AtomicU64::new(0),
            }),
        }
    }

    /// Publish to every current subscriber of `event.run_id`. Non-blocking:
    /// acquires the registry mutex only long enough to snapshot the
    /// matching subscriber list.
    pub fn publish(&self, event: Event) {
        self.inner.published_total.fetch_add(1, Ordering::Relaxed);
        let subscribers = {
            let map = self.inner.subscribers.lock().unwrap();
            map.get(&event.run_id).cloned()
        };
        let Some(subscribers) = subscribers else {
            return;
        };
        for (_, subscriber) in subscribers {
            if subscriber.closed.load(Ordering::Acquire) {
                continue;
            }
            {
                let mut queue = subscriber.queue.lock().unwrap();
                if queue.len() >= self.inner.capacity {
                    queue.pop_front();
                    subscriber.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(event.clone());
            }
            subscriber.notify.notify_waiters();
        }
    }

    /// Open a new subscription for `run_id`. Rejects beyond
    /// `max_clients_per_run` concurrent subscriptions for one run.
    pub fn subscribe(&self, run_id: RunId) -> Result<Subscription, TooManySubscribers> {
        let subscriber = Arc::new(Subscriber {
            queue: Mutex::new(VecDeque::with_capacity(self.inner.capacity.min(64))),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut map = self.inner.subscribers.lock().unwrap();
        let list = map.entry(run_id).or_default();
        if list.len() >= self.inner.max_per_run {
            return Err(TooManySubscribers(run_id));
        }
        list.push((id, subscriber.clone()));
        drop(map);

        Ok(Subscription {
            bus: self.inner.clone(),
            run_id,
            id,
            subscriber,
        })
    }

    /// Close every subscription for `run_id` (e.g. after a terminal event
    /// plus a retention window, or on process-wide cancellation).
    pub fn close_run(&self, run_id: RunId) {
        let mut map = self.inner.subscribers.lock().unwrap();
        if let Some(list) = map.remove(&run_id) {
            for (_, subscriber) in list {
                subscriber.closed.store(true, Ordering::Release);
                subscriber.notify.notify_waiters();
            }
        }
    }

    /// Close every subscription across every run. Used on process-wide
    /// cancellation (Section 4.8): producers keep publishing as no-ops
    /// afterwards since `publish` tolerates an absent run entry.
    pub fn close_all(&self) {
        let mut map = self.inner.subscribers.lock().unwrap();
        for (_, list) in map.drain() {
            for (_, subscriber) in list {
                subscriber.closed.store(true, Ordering::Release);
                subscriber.notify.notify_waiters();
            }
        }
    }

    pub fn published_total(&self) -> u64 {
        self.inner.published_total.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self, run_id: RunId) -> usize {
        let map = self.inner.subscribers.lock().unwrap();
        map.get(&run_id).map_or(0, Vec::len)
    }
}
