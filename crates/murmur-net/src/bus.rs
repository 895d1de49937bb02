//! Typed event bus for unsolicited inbound events.
//!
//! Handlers are registered per event name and invoked in registration order.
//! Each [`TransportClient`](crate::TransportClient) owns exactly one bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::trace;

use murmur_shared::protocol::ServerEvent;

/// Synthetic event published once when the channel goes away.
pub const EVENT_DISCONNECTED: &str = "disconnected";

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Server(ServerEvent),
    Disconnected,
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Server(event) => event.name(),
            InboundEvent::Disconnected => EVENT_DISCONNECTED,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&InboundEvent) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<&'static str, Vec<(SubscriptionId, Handler)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, event_name: &'static str, handler: F) -> SubscriptionId
    where
        F: Fn(&InboundEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(event_name)
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        removed
    }

    /// Invoke every handler registered for the event's name. Returns the
    /// number of handlers called.
    pub fn publish(&self, event: &InboundEvent) -> usize {
        // Snapshot so handlers may subscribe or unsubscribe re-entrantly.
        let snapshot: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event.name())
            .map(|list| list.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();

        trace!(event = event.name(), handlers = snapshot.len(), "Publishing inbound event");

        for handler in &snapshot {
            handler(event);
        }
        snapshot.len()
    }

    pub fn handler_count(&self, event_name: &str) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(event_name)
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[test]
    fn test_handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = seen.clone();
            bus.subscribe(EVENT_DISCONNECTED, move |_| seen.lock().unwrap().push(tag));
        }

        assert_eq!(bus.publish(&InboundEvent::Disconnected), 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_publish_only_reaches_matching_name() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        let h = hits.clone();
        bus.subscribe("new_message", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(bus.publish(&InboundEvent::Disconnected), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe(EVENT_DISCONNECTED, |_| {});
        bus.subscribe(EVENT_DISCONNECTED, |_| {});
        assert_eq!(bus.handler_count(EVENT_DISCONNECTED), 2);

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.handler_count(EVENT_DISCONNECTED), 1);
    }
}
