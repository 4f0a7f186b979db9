//! Event bus: fans decoded market-data changes out to local subscribers
//! (the WebSocket push surface, and anything else embedding this crate as
//! a library) without letting one slow reader stall the others.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::backfill::BackfillResult;
use crate::model::{Channel, OrderBook, Subscription, Symbol, Ticker};

/// What happens to a new event when a subscriber's queue is already full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for room. Only appropriate for low-rate, must-not-miss events.
    Block,
    /// Evict the oldest queued event to make room for the new one.
    DropOldest,
    /// Discard the new event, keeping whatever is already queued.
    DropNewest,
}

/// An event published on the bus. Distinct from [`crate::codec::Event`]:
/// these are post-ingest, already-applied state changes, not raw upstream
/// frames.
#[derive(Debug, Clone)]
pub enum BusEvent {
    TickerChanged(Ticker),
    BookReplaced(OrderBook),
    BookChanged(OrderBook),
    Subscribed(Subscription),
    Unsubscribed(Channel, Symbol),
    BackfillCompleted(BackfillResult),
}

/// A `VecDeque`-backed bounded channel with pluggable overflow behavior.
///
/// tokio's `mpsc` can express `Block` (via `send().await`) and `DropNewest`
/// (via `try_send`), but has no way to evict from the front for
/// `DropOldest`, so all three policies are implemented uniformly here over
/// a mutex-guarded deque plus two `Notify`s. Critical sections are
/// pointer-chasing only and never held across an `.await`.
struct BoundedQueue<T> {
    state: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    readable: Notify,
    writable: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl<T> BoundedQueue<T> {
    fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            state: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
            capacity: capacity.max(1),
            policy,
            readable: Notify::new(),
            writable: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    async fn push(&self, item: T) {
        loop {
            {
                let mut q = self.state.lock();
                if q.len() < self.capacity {
                    q.push_back(item);
                    drop(q);
                    self.readable.notify_one();
                    return;
                }
                match self.policy {
                    OverflowPolicy::DropNewest => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    OverflowPolicy::DropOldest => {
                        q.pop_front();
                        q.push_back(item);
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        drop(q);
                        self.readable.notify_one();
                        return;
                    }
                    OverflowPolicy::Block => {}
                }
            }
            self.writable.notified().await;
        }
    }

    async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut q = self.state.lock();
                if let Some(item) = q.pop_front() {
                    drop(q);
                    self.writable.notify_one();
                    return Some(item);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.readable.notify_waiters();
    }
}

/// A subscriber's receiving end. Dropping it (or calling
/// [`EventBus::unsubscribe`]) stops further delivery.
pub struct Subscriber {
    id: u64,
    queue: Arc<BoundedQueue<BusEvent>>,
}

impl Subscriber {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Await the next event, or `None` once the bus has unsubscribed this
    /// handle.
    pub async fn recv(&self) -> Option<BusEvent> {
        self.queue.pop().await
    }

    /// Events dropped for this subscriber since it connected (queue
    /// overflow under `DropOldest`/`DropNewest`).
    pub fn dropped(&self) -> u64 {
        self.queue.dropped_count()
    }
}

/// Central fan-out point. One [`EventBus`] per running service; cheap to
/// clone (internally `Arc`-backed) for sharing with the API layer.
pub struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Arc<BoundedQueue<BusEvent>>)>>,
    default_capacity: usize,
    default_policy: OverflowPolicy,
}

impl EventBus {
    pub fn new(default_capacity: usize, default_policy: OverflowPolicy) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
            default_capacity,
            default_policy,
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        self.subscribe_with(self.default_capacity, self.default_policy)
    }

    pub fn subscribe_with(&self, capacity: usize, policy: OverflowPolicy) -> Subscriber {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(BoundedQueue::new(capacity, policy));
        self.subscribers.lock().push((id, queue.clone()));
        Subscriber { id, queue }
    }

    pub fn unsubscribe(&self, id: u64) {
        let mut subs = self.subscribers.lock();
        if let Some(pos) = subs.iter().position(|(sid, _)| *sid == id) {
            let (_, queue) = subs.remove(pos);
            queue.close();
        }
    }

    /// Deliver `event` to every current subscriber. Pushes run concurrently
    /// so a subscriber waiting on a full `Block` queue does not delay
    /// delivery to subscribers whose queues have room.
    pub async fn publish(&self, event: BusEvent) {
        let subs: Vec<_> = self.subscribers.lock().iter().map(|(_, q)| q.clone()).collect();
        let pushes = subs.iter().map(|q| q.push(event.clone()));
        futures_util::future::join_all(pushes).await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ticker(symbol: &str) -> Ticker {
        Ticker {
            symbol: symbol.to_string(),
            last: 1.0,
            bid: None,
            ask: None,
            volume_24h: 0.0,
            change_24h: 0.0,
            high_24h: 0.0,
            low_24h: 0.0,
            source_ts: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn drop_oldest_keeps_most_recent_events() {
        let bus = EventBus::new(2, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        for i in 0..5 {
            bus.publish(BusEvent::TickerChanged(ticker(&format!("S{i}")))).await;
        }
        let mut seen = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), sub.recv()).await
        {
            if let BusEvent::TickerChanged(t) = ev {
                seen.push(t.symbol);
            }
        }
        assert_eq!(seen, vec!["S3", "S4"]);
        assert_eq!(sub.dropped(), 3);
    }

    #[tokio::test]
    async fn drop_newest_discards_incoming_when_full() {
        let bus = EventBus::new(1, OverflowPolicy::DropNewest);
        let sub = bus.subscribe();
        bus.publish(BusEvent::TickerChanged(ticker("A"))).await;
        bus.publish(BusEvent::TickerChanged(ticker("B"))).await;
        let ev = sub.recv().await.unwrap();
        match ev {
            BusEvent::TickerChanged(t) => assert_eq!(t.symbol, "A"),
            _ => panic!("wrong event"),
        }
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_ends_delivery() {
        let bus = EventBus::new(4, OverflowPolicy::DropOldest);
        let sub = bus.subscribe();
        bus.unsubscribe(sub.id());
        assert_eq!(sub.recv().await, None);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_block_subscriber_does_not_starve_drop_oldest_subscriber() {
        let bus = Arc::new(EventBus::new(1, OverflowPolicy::DropOldest));
        let blocked = bus.subscribe_with(1, OverflowPolicy::Block);
        let fast = bus.subscribe();

        // Fill the blocked subscriber's single slot, then publish again: the
        // publish future will keep awaiting room for `blocked`, but `fast`
        // must already have its event queued before that await resolves.
        let bus2 = bus.clone();
        let publisher = tokio::spawn(async move {
            bus2.publish(BusEvent::TickerChanged(ticker("first"))).await;
            bus2.publish(BusEvent::TickerChanged(ticker("second"))).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let fast_ev = tokio::time::timeout(std::time::Duration::from_millis(50), fast.recv())
            .await
            .expect("fast subscriber should not be blocked by the slow one");
        assert!(fast_ev.is_some());

        // Drain the blocked subscriber so the spawned publisher can finish.
        let _ = blocked.recv().await;
        let _ = blocked.recv().await;
        let _ = publisher.await;
    }
}
