// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-session FIFO of undelivered events.
//!
//! Appenders may be any number of mutation-processing threads; the session's
//! sequence counter is advanced under the queue mutex, so the order in which
//! appends win the lock is the delivery order. Exactly one reader drains at a
//! time. A drain never removes events: delivery is confirmed with
//! [`EventQueue::acknowledge`], and every new drain restarts right after the
//! last acknowledged sequence number.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use serde::{Deserialize, Serialize};

use crate::core::error::{CacheError, CacheResult};
use crate::core::event::CacheEvent;

/// Serializable image of a queue, used for durable session records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub next_sequence: u64,
    pub last_acknowledged: u64,
    pub events: Vec<CacheEvent>,
}

#[derive(Debug)]
struct QueueInner {
    events: VecDeque<CacheEvent>,
    next_sequence: u64,
    last_acknowledged: u64,
    closed: bool,
}

impl QueueInner {
    #[inline]
    fn has_pending(&self) -> bool {
        self.next_sequence - 1 > self.last_acknowledged
    }
}

#[derive(Debug)]
pub struct EventQueue {
    session: String,
    capacity: Option<usize>,
    inner: Mutex<QueueInner>,
    available: Condvar,
    reading: AtomicBool,
    enqueued: CachePadded<AtomicU64>,
    rejected: CachePadded<AtomicU64>,
}

impl EventQueue {
    pub fn new(session: impl Into<String>, capacity: Option<usize>) -> Self {
        Self::from_parts(session.into(), capacity, VecDeque::new(), 1, 0)
    }

    /// Rebuild a queue from a persisted snapshot. Events are re-sorted and any
    /// already acknowledged ones are discarded.
    pub fn restore(
        session: impl Into<String>,
        capacity: Option<usize>,
        snapshot: QueueSnapshot,
    ) -> CacheResult<Self> {
        let mut events = snapshot.events;
        events.sort_by_key(|e| e.sequence);
        events.retain(|e| e.sequence > snapshot.last_acknowledged);

        let contiguous = events
            .iter()
            .enumerate()
            .all(|(i, e)| e.sequence == snapshot.last_acknowledged + 1 + i as u64);
        let expected_next = snapshot.last_acknowledged + 1 + events.len() as u64;
        if !contiguous || snapshot.next_sequence != expected_next {
            return Err(CacheError::persistence(format!(
                "queue snapshot is not contiguous: acknowledged {}, next {}, {} events",
                snapshot.last_acknowledged,
                snapshot.next_sequence,
                events.len()
            )));
        }

        Ok(Self::from_parts(
            session.into(),
            capacity,
            events.into(),
            snapshot.next_sequence,
            snapshot.last_acknowledged,
        ))
    }

    fn from_parts(
        session: String,
        capacity: Option<usize>,
        events: VecDeque<CacheEvent>,
        next_sequence: u64,
        last_acknowledged: u64,
    ) -> Self {
        Self {
            session,
            capacity,
            inner: Mutex::new(QueueInner {
                events,
                next_sequence,
                last_acknowledged,
                closed: false,
            }),
            available: Condvar::new(),
            reading: AtomicBool::new(false),
            enqueued: CachePadded::new(AtomicU64::new(0)),
            rejected: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("event queue mutex poisoned")
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    /// Append an event, assigning the session's next sequence number.
    ///
    /// A rejected event consumes no sequence number, so a full queue never
    /// introduces a gap.
    pub fn enqueue(&self, mut event: CacheEvent) -> CacheResult<u64> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(CacheError::invalid_state(format!(
                "event queue for session '{}' is closed",
                self.session
            )));
        }
        if let Some(capacity) = self.capacity {
            if inner.events.len() >= capacity {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                return Err(CacheError::queue_full(self.session.clone(), capacity));
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        event.sequence = sequence;
        inner.events.push_back(event);
        drop(inner);

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.available.notify_all();
        Ok(sequence)
    }

    /// Start a drain over what is queued right now.
    ///
    /// Fails with `InvalidState` if another drain of this queue is alive.
    pub fn drain(self: &Arc<Self>) -> CacheResult<Drain> {
        self.begin_read()?;
        let inner = self.lock();
        let (cursor, bound) = (inner.last_acknowledged, inner.next_sequence - 1);
        drop(inner);
        Ok(Drain {
            queue: Arc::clone(self),
            cursor,
            bound,
        })
    }

    /// Like [`drain`](Self::drain) but blocks up to `timeout` while nothing is
    /// pending. An empty drain is returned on timeout or close.
    pub fn drain_wait(self: &Arc<Self>, timeout: Duration) -> CacheResult<Drain> {
        self.begin_read()?;
        // A timeout past the representable range waits until woken
        let deadline = Instant::now().checked_add(timeout);
        let mut inner = self.lock();
        while !inner.has_pending() && !inner.closed {
            inner = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    self.available
                        .wait_timeout(inner, deadline - now)
                        .expect("event queue mutex poisoned")
                        .0
                }
                None => self
                    .available
                    .wait(inner)
                    .expect("event queue mutex poisoned"),
            };
        }
        let (cursor, bound) = (inner.last_acknowledged, inner.next_sequence - 1);
        drop(inner);
        Ok(Drain {
            queue: Arc::clone(self),
            cursor,
            bound,
        })
    }

    fn begin_read(&self) -> CacheResult<()> {
        self.reading
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| {
                CacheError::invalid_state(format!(
                    "a drain of session '{}' is already in progress",
                    self.session
                ))
            })
    }

    /// Confirm delivery of every event up to and including `sequence`.
    ///
    /// Acknowledging an already acknowledged sequence is a no-op.
    pub fn acknowledge(&self, sequence: u64) -> CacheResult<()> {
        let mut inner = self.lock();
        if sequence <= inner.last_acknowledged {
            return Ok(());
        }
        if sequence >= inner.next_sequence {
            return Err(CacheError::invalid_parameter_named(
                format!(
                    "sequence {sequence} was never assigned for session '{}' (next is {})",
                    self.session, inner.next_sequence
                ),
                "sequence",
            ));
        }
        while inner
            .events
            .front()
            .is_some_and(|event| event.sequence <= sequence)
        {
            inner.events.pop_front();
        }
        inner.last_acknowledged = sequence;
        Ok(())
    }

    pub fn last_acknowledged(&self) -> u64 {
        self.lock().last_acknowledged
    }

    /// Sequence number the next enqueued event will receive
    pub fn next_sequence(&self) -> u64 {
        self.lock().next_sequence
    }

    /// Number of events not yet acknowledged
    pub fn len(&self) -> usize {
        self.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn total_rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let inner = self.lock();
        QueueSnapshot {
            next_sequence: inner.next_sequence,
            last_acknowledged: inner.last_acknowledged,
            events: inner.events.iter().cloned().collect(),
        }
    }

    /// Refuse further appends and wake any blocked reader.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

/// Lazy, bounded iteration over a queue.
///
/// The upper bound is fixed when the drain starts: events appended while it
/// runs are left for the next drain.
#[derive(Debug)]
pub struct Drain {
    queue: Arc<EventQueue>,
    cursor: u64,
    bound: u64,
}

impl Drain {
    /// Highest sequence number this drain will yield
    pub fn bound(&self) -> u64 {
        self.bound
    }

    /// Number of events left in this drain
    pub fn remaining(&self) -> u64 {
        self.bound.saturating_sub(self.cursor)
    }

    pub fn queue(&self) -> &Arc<EventQueue> {
        &self.queue
    }
}

impl Iterator for Drain {
    type Item = CacheEvent;

    fn next(&mut self) -> Option<CacheEvent> {
        if self.cursor >= self.bound {
            return None;
        }
        let inner = self.queue.lock();
        let front = inner.events.front()?.sequence;
        let target = (self.cursor + 1).max(front);
        if target > self.bound {
            self.cursor = self.bound;
            return None;
        }
        // Queued sequence numbers are contiguous from the front.
        let event = inner.events.get((target - front) as usize)?.clone();
        self.cursor = target;
        Some(event)
    }
}

impl Drop for Drain {
    fn drop(&mut self) {
        self.queue.reading.store(false, Ordering::Release);
    }
}
