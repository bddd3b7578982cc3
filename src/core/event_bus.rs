//! Per-instance event bus.
//!
//! Architecture:
//! - Subscribers register a callback for one `InstanceEventKind`
//! - emit() only queues into an outbox (safe to call while the instance is locked)
//! - dispatch() drains the outbox, invokes callbacks and keeps a bounded copy
//!   of each event for poll()
//!
//! Callback order: FIFO (first-subscribed, first-called) within the same kind.
//!
//! Cloning the bus yields a handle to the same subscribers and queues, so the
//! manager can grab it under the instance lock and dispatch after releasing it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use log::warn;

use crate::entities::{InstanceEvent, InstanceEventKind};

/// Maximum events kept for poll() before oldest are evicted
const MAX_QUEUE_SIZE: usize = 1000;

/// Callback invoked on dispatch
pub type EventCallback = Arc<dyn Fn(&InstanceEvent) + Send + Sync>;

/// Handle returned by subscribe(), used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Clone)]
pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<InstanceEventKind, Vec<(SubscriptionId, EventCallback)>>>>,
    outbox: Arc<Mutex<Vec<InstanceEvent>>>,
    queue: Arc<Mutex<VecDeque<InstanceEvent>>>,
    next_id: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_kinds", &self.subscribers.read().map(|s| s.len()).unwrap_or(0))
            .field("outbox_len", &self.outbox.lock().map(|q| q.len()).unwrap_or(0))
            .field("queue_len", &self.queue.lock().map(|q| q.len()).unwrap_or(0))
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            outbox: Arc::new(Mutex::new(Vec::new())),
            queue: Arc::new(Mutex::new(VecDeque::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    // ========== Pub/Sub ==========

    /// Subscribe to one kind of event.
    pub fn subscribe<F>(&self, kind: InstanceEventKind, callback: F) -> SubscriptionId
    where
        F: Fn(&InstanceEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push((id, Arc::new(callback)));
        id
    }

    /// Remove a single subscription. Returns false if unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        for list in subs.values_mut() {
            if let Some(pos) = list.iter().position(|(sid, _)| *sid == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Queue event for the next dispatch()
    pub fn emit(&self, event: InstanceEvent) {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }

    /// Deliver all queued events to subscribers. Returns number delivered.
    ///
    /// Callbacks may emit further events; those are delivered in the same call.
    pub fn dispatch(&self) -> usize {
        let mut delivered = 0;
        loop {
            let batch = std::mem::take(&mut *self.outbox.lock().unwrap_or_else(|e| e.into_inner()));
            if batch.is_empty() {
                return delivered;
            }
            for event in batch {
                // Clone callback list so callbacks can subscribe/unsubscribe
                let callbacks: Vec<EventCallback> = self
                    .subscribers
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .get(&event.kind())
                    .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                    .unwrap_or_default();
                for cb in callbacks {
                    cb(&event);
                }
                self.push_queue(event);
                delivered += 1;
            }
        }
    }

    fn push_queue(&self, event: InstanceEvent) {
        let mut queue = self.queue.lock().unwrap_or_else(|e| e.into_inner());
        if queue.len() >= MAX_QUEUE_SIZE {
            let evict_count = queue.len() / 2;
            warn!("EventBus queue full ({} events), evicting oldest {}", queue.len(), evict_count);
            queue.drain(0..evict_count);
        }
        queue.push_back(event);
    }

    // ========== Deferred Processing ==========

    /// Take all dispatched events since the last poll
    pub fn poll(&self) -> Vec<InstanceEvent> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect()
    }

    // ========== Utilities ==========

    /// Clear all subscribers and queues
    pub fn clear(&self) {
        self.subscribers.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    pub fn has_subscribers(&self, kind: InstanceEventKind) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|v| v.len())
            .sum()
    }

    /// Events waiting for dispatch()
    pub fn pending_len(&self) -> usize {
        self.outbox.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::InstanceState;
    use std::sync::atomic::{AtomicI32, AtomicUsize};

    #[test]
    fn test_emit_is_deferred_until_dispatch() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);

        bus.subscribe(InstanceEventKind::Complete, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(InstanceEvent::Complete);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
        assert_eq!(bus.pending_len(), 1);

        assert_eq!(bus.dispatch(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(bus.pending_len(), 0);
    }

    #[test]
    fn test_callbacks_filtered_by_kind() {
        let bus = EventBus::new();
        let frames = Arc::new(AtomicUsize::new(0));
        let f = Arc::clone(&frames);
        bus.subscribe(InstanceEventKind::EnterFrame, move |e| {
            if let InstanceEvent::EnterFrame { frame } = e {
                f.fetch_add(*frame as usize, Ordering::SeqCst);
            }
        });

        bus.emit(InstanceEvent::EnterFrame { frame: 3.0 });
        bus.emit(InstanceEvent::LoopComplete);
        bus.emit(InstanceEvent::EnterFrame { frame: 4.0 });
        bus.dispatch();

        assert_eq!(frames.load(Ordering::SeqCst), 7);
        // Everything is kept for poll(), subscribed or not
        assert_eq!(bus.poll().len(), 3);
        assert!(bus.poll().is_empty());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let counter = Arc::new(AtomicI32::new(0));
        let c = Arc::clone(&counter);
        let id = bus.subscribe(InstanceEventKind::DataReady, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        bus.emit(InstanceEvent::DataReady);
        bus.dispatch();
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));

        bus.emit(InstanceEvent::DataReady);
        bus.dispatch();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_clone_shares_state() {
        let bus = EventBus::new();
        let handle = bus.clone();
        handle.emit(InstanceEvent::StateChange {
            from: InstanceState::Idle,
            to: InstanceState::Loading,
        });
        assert_eq!(bus.dispatch(), 1);
        assert_eq!(handle.poll().len(), 1);
    }

    #[test]
    fn test_queue_eviction() {
        let bus = EventBus::new();
        for i in 0..(MAX_QUEUE_SIZE + 1) {
            bus.emit(InstanceEvent::EnterFrame { frame: i as f64 });
        }
        bus.dispatch();
        assert!(bus.queue_len() <= MAX_QUEUE_SIZE);
        assert!(bus.queue_len() > MAX_QUEUE_SIZE / 2);
    }
}
