//! WebSocket subscription bookkeeping.
//!
//! Maps `eth_subscribe` ids to the channel feeding the subscriber. Dropping an
//! entry closes its channel, which is how subscribers learn that the
//! connection went away.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;

use chainclient_core::transport::SubscriptionId;

/// Metadata for a single subscription.
struct SubscriptionEntry {
    /// The subscription type (e.g. `"newHeads"`, `"logs"`).
    kind: String,
    /// Channel to forward incoming messages to the caller.
    sender: mpsc::UnboundedSender<Value>,
}

/// Active subscriptions of one WebSocket connection.
#[derive(Clone, Default)]
pub struct SubscriptionManager {
    entries: Arc<Mutex<HashMap<SubscriptionId, SubscriptionEntry>>>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriptionEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Register a new subscription.
    pub fn register(&self, id: SubscriptionId, kind: String) -> mpsc::UnboundedReceiver<Value> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.entries()
            .insert(id, SubscriptionEntry { kind, sender: tx });
        rx
    }

    /// Forward an incoming notification to the correct subscription.
    ///
    /// A subscriber that dropped its receiver is forgotten.
    pub fn dispatch(&self, id: &SubscriptionId, message: Value) {
        let mut entries = self.entries();
        let Some(entry) = entries.get(id) else {
            tracing::trace!(%id, "notification for unknown subscription");
            return;
        };
        if entry.sender.send(message).is_err() {
            tracing::debug!(%id, kind = %entry.kind, "subscriber gone, dropping subscription");
            entries.remove(id);
        }
    }

    /// Remove a subscription (e.g. before `eth_unsubscribe`).
    pub fn remove(&self, id: &SubscriptionId) -> bool {
        self.entries().remove(id).is_some()
    }

    /// Drop every subscription, closing their channels.
    pub fn clear(&self) -> usize {
        let mut entries = self.entries();
        let n = entries.len();
        entries.clear();
        n
    }

    /// Number of active subscriptions.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Returns `true` if there are no active subscriptions.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_dispatch() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xdeadbeef".into());
        let mut rx = mgr.register(id.clone(), "newHeads".into());

        mgr.dispatch(&id, serde_json::json!({"number": "0x1"}));

        let msg = rx.try_recv().unwrap();
        assert_eq!(msg["number"], "0x1");
    }

    #[test]
    fn remove_subscription() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0x1".into());
        let _rx = mgr.register(id.clone(), "logs".into());
        assert_eq!(mgr.len(), 1);
        assert!(mgr.remove(&id));
        assert!(!mgr.remove(&id));
        assert!(mgr.is_empty());
    }

    #[test]
    fn clear_closes_channels() {
        let mgr = SubscriptionManager::new();
        let mut a = mgr.register(SubscriptionId("0xa".into()), "newHeads".into());
        let mut b = mgr.register(SubscriptionId("0xb".into()), "logs".into());
        assert_eq!(mgr.clear(), 2);
        assert!(a.try_recv().is_err());
        assert!(b.blocking_recv().is_none());
    }

    #[test]
    fn dropped_receiver_is_forgotten() {
        let mgr = SubscriptionManager::new();
        let id = SubscriptionId("0xa".into());
        drop(mgr.register(id.clone(), "newHeads".into()));
        mgr.dispatch(&id, Value::Null);
        assert!(mgr.is_empty());
    }
}
