// SPDX-License-Identifier: MIT OR Apache-2.0

//! Table of per-session event queues.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use super::event_queue::{Drain, EventQueue, QueueSnapshot};
use crate::core::error::{CacheError, CacheResult};
use crate::core::event::CacheEvent;

/// Answers whether a session still holds the interest or query an event was
/// produced for.
pub trait SubscriptionLookup: Send + Sync {
    fn accepts(&self, session: &str, event: &CacheEvent) -> bool;
}

/// What [`EventQueueStore::enqueue`] did with an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued(u64),
    /// No matching subscription or no queue for the session
    Dropped,
}

pub struct EventQueueStore {
    queues: DashMap<String, Arc<EventQueue>>,
    capacity: Option<usize>,
    lookup: Arc<dyn SubscriptionLookup>,
}

impl std::fmt::Debug for EventQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventQueueStore")
            .field("queues", &self.queues.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl EventQueueStore {
    pub fn new(capacity: Option<usize>, lookup: Arc<dyn SubscriptionLookup>) -> Self {
        Self {
            queues: DashMap::new(),
            capacity,
            lookup,
        }
    }

    /// Create an empty queue for a new session, replacing any leftover one.
    pub fn create_queue(&self, session: &str) -> Arc<EventQueue> {
        let queue = Arc::new(EventQueue::new(session, self.capacity));
        if let Some(previous) = self.queues.insert(session.to_string(), Arc::clone(&queue)) {
            previous.close();
        }
        queue
    }

    /// Install a queue rebuilt from a persisted snapshot.
    pub fn restore_queue(&self, session: &str, snapshot: QueueSnapshot) -> CacheResult<Arc<EventQueue>> {
        let queue = Arc::new(EventQueue::restore(session, self.capacity, snapshot)?);
        if let Some(previous) = self.queues.insert(session.to_string(), Arc::clone(&queue)) {
            previous.close();
        }
        Ok(queue)
    }

    pub fn queue(&self, session: &str) -> Option<Arc<EventQueue>> {
        self.queues.get(session).map(|q| Arc::clone(q.value()))
    }

    /// Destroy a session's queue; pending events are discarded.
    pub fn remove_queue(&self, session: &str) -> Option<Arc<EventQueue>> {
        let (_, queue) = self.queues.remove(session)?;
        queue.close();
        log::debug!(
            "[{session}] discarded event queue with {} undelivered events",
            queue.len()
        );
        Some(queue)
    }

    /// Queue an event for `session`.
    ///
    /// Events for which the session no longer holds a matching interest or
    /// query are dropped, as are events for sessions without a queue. A full
    /// queue surfaces as `QueueFull`.
    pub fn enqueue(&self, session: &str, event: CacheEvent) -> CacheResult<EnqueueOutcome> {
        if !self.lookup.accepts(session, &event) {
            log::debug!(
                "[{session}] no subscription for {} on key '{}', dropping",
                event.operation,
                event.key
            );
            return Ok(EnqueueOutcome::Dropped);
        }
        let Some(queue) = self.queue(session) else {
            log::debug!("[{session}] no event queue, dropping event for '{}'", event.key);
            return Ok(EnqueueOutcome::Dropped);
        };
        let sequence = queue.enqueue(event)?;
        Ok(EnqueueOutcome::Queued(sequence))
    }

    pub fn drain(&self, session: &str) -> CacheResult<Drain> {
        self.require(session)?.drain()
    }

    pub fn drain_wait(&self, session: &str, timeout: Duration) -> CacheResult<Drain> {
        self.require(session)?.drain_wait(timeout)
    }

    pub fn acknowledge(&self, session: &str, sequence: u64) -> CacheResult<()> {
        self.require(session)?.acknowledge(sequence)
    }

    /// Undelivered event count per session
    pub fn depths(&self) -> Vec<(String, usize)> {
        self.queues
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    fn require(&self, session: &str) -> CacheResult<Arc<EventQueue>> {
        self.queue(session)
            .ok_or_else(|| CacheError::session_not_found(session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{AttributeValue, EventSource, Operation};

    struct AcceptInterestOnly;

    impl SubscriptionLookup for AcceptInterestOnly {
        fn accepts(&self, _session: &str, event: &CacheEvent) -> bool {
            event.source == EventSource::Interest
        }
    }

    fn store() -> EventQueueStore {
        EventQueueStore::new(None, Arc::new(AcceptInterestOnly))
    }

    #[test]
    fn test_enqueue_drops_without_subscription() {
        let store = store();
        store.create_queue("s");
        let event = CacheEvent::new(
            "K",
            None,
            Some(AttributeValue::Int(1)),
            Operation::Create,
            EventSource::Query("cq".into()),
        );
        assert_eq!(store.enqueue("s", event).unwrap(), EnqueueOutcome::Dropped);
        assert_eq!(store.queue("s").unwrap().len(), 0);
    }

    #[test]
    fn test_enqueue_drops_without_queue() {
        let store = store();
        let event = CacheEvent::new("K", None, None, Operation::Destroy, EventSource::Interest);
        assert_eq!(store.enqueue("ghost", event).unwrap(), EnqueueOutcome::Dropped);
    }

    #[test]
    fn test_enqueue_drain_acknowledge() {
        let store = store();
        store.create_queue("s");
        for value in 1..=3i32 {
            let event = CacheEvent::new(
                "K",
                None,
                Some(AttributeValue::Int(value)),
                Operation::Update,
                EventSource::Interest,
            );
            assert_eq!(
                store.enqueue("s", event).unwrap(),
                EnqueueOutcome::Queued(value as u64)
            );
        }
        let first: Vec<u64> = store.drain("s").unwrap().map(|e| e.sequence).collect();
        assert_eq!(first, vec![1, 2, 3]);
        store.acknowledge("s", 2).unwrap();
        let rest: Vec<u64> = store.drain("s").unwrap().map(|e| e.sequence).collect();
        assert_eq!(rest, vec![3]);
        assert_eq!(store.depths(), vec![("s".to_string(), 1)]);
    }

    #[test]
    fn test_remove_queue_closes_it() {
        let store = store();
        let queue = store.create_queue("s");
        store.remove_queue("s");
        assert!(queue.is_closed());
        assert!(matches!(
            store.drain("s"),
            Err(CacheError::SessionNotFound { .. })
        ));
    }
}
