// =============================================================================
// Event Bus — bounded pub/sub with a dedicated dispatch thread
// =============================================================================
//
// Delivery contract:
//   - `publish` never blocks; a saturated queue drops the event and counts it.
//   - FIFO per publisher thread.
//   - Callbacks run on the dispatcher thread with no bus lock held, so a
//     subscriber may re-enter `publish` without deadlocking.
//   - A panicking subscriber is counted and logged; dispatch continues.
//   - Subscriptions are weak by default: dropping the returned handle removes
//     the subscriber within one dispatch cycle, no `unsubscribe` required.
//
// Shutdown pushes a sentinel with a retry-and-drain loop, then waits up to
// `JOIN_TIMEOUT` for the dispatcher to exit.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::events::{BusEvent, EventKind};

/// How long `stop` waits for the dispatcher thread to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(3);
/// Dispatcher wake-up interval while the queue is empty.
const POP_TIMEOUT: Duration = Duration::from_millis(100);
/// Attempts to place the shutdown sentinel into a saturated queue.
const SENTINEL_MAX_ATTEMPTS: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublishError {
    #[error("event queue full, event dropped")]
    QueueFull,
}

type Callback = dyn Fn(&BusEvent) + Send + Sync + 'static;

struct Subscription {
    id: u64,
    kind: EventKind,
    callback: Box<Callback>,
}

/// Keeps a subscription alive. Dropping the handle of a weak subscription
/// unregisters it; strong subscriptions survive until `unsubscribe`.
pub struct SubscriptionHandle {
    subscription: Arc<Subscription>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.subscription.id
    }

    pub fn kind(&self) -> EventKind {
        self.subscription.kind
    }
}

enum Entry {
    Weak(Weak<Subscription>),
    Strong(Arc<Subscription>),
}

impl Entry {
    fn upgrade(&self) -> Option<Arc<Subscription>> {
        match self {
            Entry::Weak(weak) => weak.upgrade(),
            Entry::Strong(strong) => Some(Arc::clone(strong)),
        }
    }

    fn id(&self) -> Option<u64> {
        match self {
            Entry::Weak(weak) => weak.upgrade().map(|s| s.id),
            Entry::Strong(strong) => Some(strong.id),
        }
    }
}

enum QueueItem {
    Event(BusEvent),
    Shutdown,
}

/// Bus statistics snapshot for observability consumers.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_processed: u64,
    pub events_dropped: u64,
    pub callback_errors: u64,
    pub queue_size: usize,
    pub subscriber_count: usize,
}

struct BusShared {
    queue: Mutex<VecDeque<QueueItem>>,
    not_empty: Condvar,
    capacity: usize,
    subscribers: Mutex<HashMap<EventKind, Vec<Entry>>>,
    processing: AtomicBool,
    next_id: AtomicU64,
    published: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    capacity_warned: AtomicBool,
}

pub struct EventBus {
    shared: Arc<BusShared>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        debug!(capacity, "event bus created");
        Self {
            shared: Arc::new(BusShared {
                queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
                not_empty: Condvar::new(),
                capacity,
                subscribers: Mutex::new(HashMap::new()),
                processing: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                published: AtomicU64::new(0),
                processed: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                capacity_warned: AtomicBool::new(false),
            }),
            dispatcher: Mutex::new(None),
        }
    }

    /// Spawn the dispatch thread. Idempotent.
    pub fn start(&self) {
        if self.shared.processing.swap(true, Ordering::SeqCst) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("bus-dispatch".into())
            .spawn(move || dispatch_loop(&shared))
            .expect("failed to spawn bus dispatcher");
        *self.dispatcher.lock() = Some(handle);
        debug!("event bus started");
    }

    /// Signal the dispatcher to stop, drain-retry the sentinel into the
    /// queue, and wait up to `JOIN_TIMEOUT` for the thread to exit.
    pub fn stop(&self) {
        if !self.shared.processing.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut sentinel_sent = false;
        for attempt in 0..SENTINEL_MAX_ATTEMPTS {
            {
                let mut queue = self.shared.queue.lock();
                if queue.len() < self.shared.capacity {
                    queue.push_back(QueueItem::Shutdown);
                    sentinel_sent = true;
                } else {
                    // Make room, then retry.
                    queue.pop_front();
                    debug!(attempt, "drained queue item while placing shutdown sentinel");
                }
            }
            if sentinel_sent {
                self.shared.not_empty.notify_one();
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        if !sentinel_sent {
            warn!("failed to place shutdown sentinel after max attempts");
        }

        if let Some(handle) = self.dispatcher.lock().take() {
            if !join_with_timeout(handle, JOIN_TIMEOUT) {
                error!("bus dispatcher did not stop within timeout");
            }
        }
        debug!("event bus stopped");
    }

    /// Register a weak subscriber. The subscription lives only as long as
    /// the returned handle; after the handle drops, the entry is pruned on
    /// the next dispatch touching its kind.
    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(kind, callback, true)
    }

    /// Register a strong subscriber. The bus keeps it alive until
    /// `unsubscribe`, even if the handle is dropped.
    pub fn subscribe_strong<F>(&self, kind: EventKind, callback: F) -> SubscriptionHandle
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        self.subscribe_inner(kind, callback, false)
    }

    fn subscribe_inner<F>(&self, kind: EventKind, callback: F, weak: bool) -> SubscriptionHandle
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let subscription = Arc::new(Subscription {
            id: self.shared.next_id.fetch_add(1, Ordering::Relaxed),
            kind,
            callback: Box::new(callback),
        });
        let entry = if weak {
            Entry::Weak(Arc::downgrade(&subscription))
        } else {
            Entry::Strong(Arc::clone(&subscription))
        };
        self.shared
            .subscribers
            .lock()
            .entry(kind)
            .or_default()
            .push(entry);
        debug!(kind = %kind, id = subscription.id, weak, "subscribed");
        SubscriptionHandle { subscription }
    }

    /// Remove a subscription by handle identity.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) {
        let mut subscribers = self.shared.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(&handle.kind()) {
            entries.retain(|entry| entry.id() != Some(handle.id()));
            if entries.is_empty() {
                subscribers.remove(&handle.kind());
            }
        }
        debug!(kind = %handle.kind(), id = handle.id(), "unsubscribed");
    }

    /// Enqueue an event for dispatch. Never blocks: a full queue drops the
    /// event, bumps `events_dropped`, and returns `QueueFull`.
    pub fn publish(&self, event: BusEvent) -> Result<(), PublishError> {
        let queue_len = {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.capacity {
                drop(queue);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(kind = %event.kind(), "event queue full, dropping event");
                return Err(PublishError::QueueFull);
            }
            queue.push_back(QueueItem::Event(event));
            queue.len()
        };
        self.shared.not_empty.notify_one();
        self.shared.published.fetch_add(1, Ordering::Relaxed);

        // Warn once per crossing of the 80% watermark.
        let threshold = self.shared.capacity * 4 / 5;
        if queue_len >= threshold {
            if !self.shared.capacity_warned.swap(true, Ordering::Relaxed) {
                warn!(
                    queue_len,
                    capacity = self.shared.capacity,
                    "event queue above 80% capacity"
                );
            }
        } else {
            self.shared.capacity_warned.store(false, Ordering::Relaxed);
        }
        Ok(())
    }

    /// True if at least one live subscriber exists for `kind`. Prunes dead
    /// weak entries as a side effect.
    pub fn has_subscribers(&self, kind: EventKind) -> bool {
        let mut subscribers = self.shared.subscribers.lock();
        if let Some(entries) = subscribers.get_mut(&kind) {
            entries.retain(|entry| entry.upgrade().is_some());
            if entries.is_empty() {
                subscribers.remove(&kind);
                return false;
            }
            return true;
        }
        false
    }

    pub fn stats(&self) -> BusStats {
        let queue_size = self.shared.queue.lock().len();
        let subscriber_count = self
            .shared
            .subscribers
            .lock()
            .values()
            .map(|entries| entries.len())
            .sum();
        BusStats {
            events_published: self.shared.published.load(Ordering::Relaxed),
            events_processed: self.shared.processed.load(Ordering::Relaxed),
            events_dropped: self.shared.dropped.load(Ordering::Relaxed),
            callback_errors: self.shared.errors.load(Ordering::Relaxed),
            queue_size,
            subscriber_count,
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.stop();
    }
}

fn dispatch_loop(shared: &BusShared) {
    loop {
        let item = {
            let mut queue = shared.queue.lock();
            if queue.is_empty() {
                shared.not_empty.wait_for(&mut queue, POP_TIMEOUT);
            }
            queue.pop_front()
        };

        match item {
            Some(QueueItem::Shutdown) => break,
            Some(QueueItem::Event(event)) => dispatch_one(shared, &event),
            None => {
                if !shared.processing.load(Ordering::SeqCst) {
                    break;
                }
            }
        }
    }
}

fn dispatch_one(shared: &BusShared, event: &BusEvent) {
    // Resolve live callbacks under the lock, invoke them outside it.
    let callbacks: Vec<Arc<Subscription>> = {
        let mut subscribers = shared.subscribers.lock();
        match subscribers.get_mut(&event.kind()) {
            Some(entries) => {
                let mut live = Vec::with_capacity(entries.len());
                entries.retain(|entry| match entry.upgrade() {
                    Some(subscription) => {
                        live.push(subscription);
                        true
                    }
                    None => false,
                });
                live
            }
            None => return,
        }
    };

    for subscription in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| (subscription.callback)(event)));
        match result {
            Ok(()) => {
                shared.processed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                shared.errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    kind = %event.kind(),
                    id = subscription.id,
                    "subscriber panicked during dispatch"
                );
            }
        }
    }
}

/// `JoinHandle::join` with a deadline. Returns false when the thread is
/// still running after `timeout` (the handle is then detached).
fn join_with_timeout(handle: std::thread::JoinHandle<()>, timeout: Duration) -> bool {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = handle.join();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::WsRawEvent;
    use crate::types::{Direction, EventSource};
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicUsize;

    fn tick_event(tick: u64) -> BusEvent {
        BusEvent::TickUpdated {
            tick,
            price: dec!(1.0),
        }
    }

    fn raw_event(name: &str) -> BusEvent {
        BusEvent::WsRaw(WsRawEvent {
            name: name.into(),
            payload: serde_json::Value::Null,
            source: EventSource::PublicWs,
            direction: Direction::Received,
            timestamp_ms: 0,
        })
    }

    fn wait_until(deadline_ms: u64, predicate: impl Fn() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_millis(deadline_ms) {
            if predicate() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        predicate()
    }

    #[test]
    fn delivers_in_publish_order() {
        let bus = EventBus::new(100);
        bus.start();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _handle = bus.subscribe(EventKind::TickUpdated, move |event| {
            if let BusEvent::TickUpdated { tick, .. } = event {
                seen_clone.lock().push(*tick);
            }
        });

        for tick in 0..50 {
            bus.publish(tick_event(tick)).unwrap();
        }
        assert!(wait_until(2000, || seen.lock().len() == 50));
        assert_eq!(*seen.lock(), (0..50).collect::<Vec<_>>());
        bus.stop();
    }

    #[test]
    fn queue_full_drops_and_counts() {
        let bus = EventBus::new(10);
        // Not started: nothing drains the queue.
        for tick in 0..10 {
            bus.publish(tick_event(tick)).unwrap();
        }
        assert_eq!(bus.publish(tick_event(99)), Err(PublishError::QueueFull));
        assert_eq!(bus.stats().events_dropped, 1);
        assert_eq!(bus.stats().events_published, 10);
    }

    #[test]
    fn weak_subscription_pruned_after_handle_drop() {
        let bus = EventBus::new(100);
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = bus.subscribe(EventKind::TickUpdated, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        bus.publish(tick_event(1)).unwrap();
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));

        drop(handle);
        bus.publish(tick_event(2)).unwrap();
        // The dead entry is pruned during this dispatch; the callback must
        // not fire again.
        assert!(wait_until(500, || !bus.has_subscribers(EventKind::TickUpdated)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        bus.stop();
    }

    #[test]
    fn strong_subscription_survives_handle_drop() {
        let bus = EventBus::new(100);
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let handle = bus.subscribe_strong(EventKind::TickUpdated, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        drop(handle);
        bus.publish(tick_event(1)).unwrap();
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 1));
        bus.stop();
    }

    #[test]
    fn reentrant_publish_does_not_deadlock() {
        let bus = Arc::new(EventBus::new(100));
        bus.start();
        let bus_clone = Arc::clone(&bus);
        let raws = Arc::new(AtomicUsize::new(0));
        let raws_clone = Arc::clone(&raws);

        // Ticks republish as raw events from within the callback.
        let _tick_handle = bus.subscribe(EventKind::TickUpdated, move |_| {
            let _ = bus_clone.publish(raw_event("reentrant"));
        });
        let _raw_handle = bus.subscribe(EventKind::WsRaw, move |_| {
            raws_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(tick_event(1)).unwrap();
        assert!(wait_until(2000, || raws.load(Ordering::SeqCst) == 1));
        bus.stop();
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let bus = EventBus::new(100);
        bus.start();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        let _bad = bus.subscribe(EventKind::TickUpdated, |_| panic!("boom"));
        let _good = bus.subscribe(EventKind::TickUpdated, move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(tick_event(1)).unwrap();
        bus.publish(tick_event(2)).unwrap();
        assert!(wait_until(2000, || hits.load(Ordering::SeqCst) == 2));
        assert_eq!(bus.stats().callback_errors, 2);
        bus.stop();
    }

    #[test]
    fn stop_drains_and_joins() {
        let bus = EventBus::new(5);
        bus.start();
        for tick in 0..5 {
            let _ = bus.publish(tick_event(tick));
        }
        bus.stop();
        // Second stop is a no-op.
        bus.stop();
    }
}
