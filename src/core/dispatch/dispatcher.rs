// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delivery dispatcher
//!
//! Drains a ready session's queue in sequence order and routes each event:
//! interest events go to the session's listeners, query events to the
//! listeners of the named continuous query. A listener that returns an
//! error or panics is reported as a fault and dispatch moves on. Every
//! dispatched event is acknowledged, so a later drain never repeats it.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::core::error::{CacheError, CacheResult, Fault, FaultKind, FaultReporter};
use crate::core::event::{CacheEvent, EventSource};
use crate::core::listener::{panic_message, EventListener};
use crate::core::query::QueryService;
use crate::core::queue::{Drain, EventQueue, EventQueueStore, SequenceCheck, SequenceTracker};
use crate::core::session::{ClientSession, SessionManager};

/// Summary of one dispatch pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    /// Redelivered sequence numbers skipped
    pub duplicates: usize,
    pub listener_faults: usize,
    /// Events whose query no longer exists; acknowledged without delivery
    pub orphaned: usize,
    pub last_sequence: Option<u64>,
    /// False if the session was not ready, so nothing was drained
    pub ready: bool,
    /// This pass delivered the last of a durable session's backlog
    pub went_live: bool,
}

struct TrackedQueue {
    queue: Weak<EventQueue>,
    tracker: SequenceTracker,
}

pub struct DeliveryDispatcher {
    queues: Arc<EventQueueStore>,
    sessions: Arc<SessionManager>,
    queries: Arc<QueryService>,
    faults: Arc<dyn FaultReporter>,
    trackers: Mutex<HashMap<String, TrackedQueue>>,
}

impl std::fmt::Debug for DeliveryDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryDispatcher")
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl DeliveryDispatcher {
    pub fn new(
        queues: Arc<EventQueueStore>,
        sessions: Arc<SessionManager>,
        queries: Arc<QueryService>,
        faults: Arc<dyn FaultReporter>,
    ) -> Self {
        Self {
            queues,
            sessions,
            queries,
            faults,
            trackers: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver everything currently queued for a ready session.
    pub fn dispatch(&self, session_id: &str) -> CacheResult<DispatchReport> {
        self.dispatch_inner(session_id, None)
    }

    /// Like [`dispatch`](Self::dispatch), but blocks up to `wait` for an
    /// event when the queue is empty.
    pub fn dispatch_wait(&self, session_id: &str, wait: Duration) -> CacheResult<DispatchReport> {
        self.dispatch_inner(session_id, Some(wait))
    }

    /// Drop duplicate-detection state for a destroyed session.
    pub fn forget(&self, session_id: &str) {
        self.trackers
            .lock()
            .expect("dispatcher tracker lock poisoned")
            .remove(session_id);
    }

    fn dispatch_inner(&self, session_id: &str, wait: Option<Duration>) -> CacheResult<DispatchReport> {
        let session = self
            .sessions
            .session(session_id)
            .ok_or_else(|| CacheError::session_not_found(session_id))?;
        let mut report = DispatchReport::default();
        if !session.is_ready() {
            log::debug!("[{session_id}] not ready for events, nothing dispatched");
            return Ok(report);
        }
        report.ready = true;

        let mut drain = match wait {
            Some(wait) => self.queues.drain_wait(session_id, wait)?,
            None => self.queues.drain(session_id)?,
        };
        let mut tracker = self.tracker_for(session_id, drain.queue());

        let outcome = self.deliver_drain(&session, &mut drain, &mut tracker, &mut report);
        self.store_tracker(session_id, drain.queue(), tracker);
        outcome?;

        let backlog_empty = drain.queue().is_empty();
        drop(drain);
        if backlog_empty && session.is_durable() && session.mark_live() {
            report.went_live = true;
            self.notify_live(&session);
        }

        if report.delivered > 0 || report.listener_faults > 0 {
            log::debug!(
                "[{session_id}] dispatched {} event(s), {} fault(s), {} duplicate(s)",
                report.delivered,
                report.listener_faults,
                report.duplicates
            );
        }
        Ok(report)
    }

    fn deliver_drain(
        &self,
        session: &ClientSession,
        drain: &mut Drain,
        tracker: &mut SequenceTracker,
        report: &mut DispatchReport,
    ) -> CacheResult<()> {
        while let Some(event) = drain.next() {
            // A keep-alive close mid-drain leaves the rest queued
            if !session.is_ready() {
                break;
            }
            let sequence = event.sequence;
            match tracker.observe(sequence) {
                SequenceCheck::Duplicate => {
                    report.duplicates += 1;
                    drain.queue().acknowledge(sequence)?;
                    continue;
                }
                SequenceCheck::Gap { expected } => log::warn!(
                    "[{}] sequence gap: expected {expected}, got {sequence}",
                    session.id()
                ),
                SequenceCheck::Fresh => {}
            }

            match self.listeners_for(session, &event) {
                Some(listeners) => {
                    for listener in &listeners {
                        if let Err(message) = invoke(listener.as_ref(), &event) {
                            report.listener_faults += 1;
                            let mut fault = Fault::new(FaultKind::Listener, message)
                                .with_session(session.id())
                                .with_sequence(sequence);
                            if let Some(query) = event.query_name() {
                                fault = fault.with_query(query);
                            }
                            self.faults.report(fault);
                        }
                    }
                    report.delivered += 1;
                }
                None => {
                    report.orphaned += 1;
                    log::debug!(
                        "[{}] no continuous query for event #{sequence}, acknowledging",
                        session.id()
                    );
                }
            }
            drain.queue().acknowledge(sequence)?;
            report.last_sequence = Some(sequence);
        }
        Ok(())
    }

    fn listeners_for(
        &self,
        session: &ClientSession,
        event: &CacheEvent,
    ) -> Option<Vec<Arc<dyn EventListener>>> {
        match &event.source {
            EventSource::Interest => Some(session.listeners()),
            EventSource::Query(name) => self
                .queries
                .get_cq(session.id(), name)
                .ok()
                .map(|query| query.listeners()),
        }
    }

    fn notify_live(&self, session: &ClientSession) {
        log::info!("[{}] backlog delivered, session is live", session.id());
        for listener in session.listeners() {
            let result = catch_unwind(AssertUnwindSafe(|| listener.after_live(session.id())));
            if let Err(panic) = result {
                self.faults.report(
                    Fault::new(
                        FaultKind::Listener,
                        format!("after_live panicked: {}", panic_message(panic.as_ref())),
                    )
                    .with_session(session.id()),
                );
            }
        }
    }

    fn tracker_for(&self, session_id: &str, queue: &Arc<EventQueue>) -> SequenceTracker {
        let trackers = self.trackers.lock().expect("dispatcher tracker lock poisoned");
        match trackers.get(session_id) {
            Some(tracked) if Weak::as_ptr(&tracked.queue) == Arc::as_ptr(queue) => tracked.tracker,
            // New or replaced queue: nothing before its restart point was seen
            _ => SequenceTracker::starting_after(queue.last_acknowledged()),
        }
    }

    fn store_tracker(&self, session_id: &str, queue: &Arc<EventQueue>, tracker: SequenceTracker) {
        self.trackers
            .lock()
            .expect("dispatcher tracker lock poisoned")
            .insert(
                session_id.to_string(),
                TrackedQueue {
                    queue: Arc::downgrade(queue),
                    tracker,
                },
            );
    }
}

/// Call `on_event`, turning both a returned error and a panic into a
/// fault message.
fn invoke(listener: &dyn EventListener, event: &CacheEvent) -> Result<(), String> {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(format!("listener failed on event #{}: {err}", event.sequence)),
        Err(panic) => Err(format!(
            "listener panicked on event #{}: {}",
            event.sequence,
            panic_message(panic.as_ref())
        )),
    }
}
