//! Subscription registry: the authoritative set of channels currently
//! wanted from upstream. The connection manager replays this set in full
//! on every reconnect and applies incremental changes while connected.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::model::{Channel, Subscription, Symbol};

/// Tracks at most one active subscription per `(channel, symbol)` pair.
pub struct SubscriptionRegistry {
    inner: Mutex<HashMap<(Channel, Symbol), Option<u32>>>,
}

impl SubscriptionRegistry {
    pub fn new(seed: Vec<Subscription>) -> Self {
        let mut inner = HashMap::new();
        for sub in seed {
            inner.insert((sub.channel, sub.symbol), sub.depth);
        }
        Self {
            inner: Mutex::new(inner),
        }
    }

    /// Add (or update the depth of) a subscription. Returns `true` if this
    /// is a new `(channel, symbol)` pair.
    pub fn subscribe(&self, channel: Channel, symbol: Symbol, depth: Option<u32>) -> bool {
        let mut inner = self.inner.lock();
        let is_new = !inner.contains_key(&(channel, symbol.clone()));
        inner.insert((channel, symbol), depth);
        is_new
    }

    /// Remove a subscription. Returns `true` if it was present.
    pub fn unsubscribe(&self, channel: Channel, symbol: &Symbol) -> bool {
        self.inner.lock().remove(&(channel, symbol.clone())).is_some()
    }

    pub fn is_subscribed(&self, channel: Channel, symbol: &Symbol) -> bool {
        self.inner.lock().contains_key(&(channel, symbol.clone()))
    }

    /// Every active subscription, for replay on (re)connect.
    pub fn snapshot(&self) -> Vec<Subscription> {
        self.inner
            .lock()
            .iter()
            .map(|((channel, symbol), depth)| Subscription {
                channel: *channel,
                symbol: symbol.clone(),
                depth: *depth,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
