// SPDX-License-Identifier: MIT OR Apache-2.0

//! A single continuous query and its membership state machine.
//!
//! ```text
//! IDLE --execute--> RUNNING --stop--> STOPPED --execute--> RUNNING
//!   \                  |                 |
//!    \---------------close---------------+--> CLOSED
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::condition::{Condition, Predicate};
use crate::core::error::{CacheError, CacheResult};
use crate::core::event::{AttributeValue, CacheEvent, EventSource, Mutation, Operation};
use crate::core::listener::{guarded, EventListener, QueryFault};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CqState {
    Idle,
    Running,
    Stopped,
    Closed,
}

impl CqState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            CqState::Idle => "IDLE",
            CqState::Running => "RUNNING",
            CqState::Stopped => "STOPPED",
            CqState::Closed => "CLOSED",
        }
    }
}

impl fmt::Display for CqState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query delta counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CqStatistics {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    /// Total deltas emitted
    pub events: u64,
    pub faults: u64,
}

/// Result of evaluating one mutation against a query.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// Query is not running
    Inactive,
    /// Membership and value unchanged, or the key never matched
    NoChange,
    Delta(CacheEvent),
    /// Predicate faulted; membership was left as it was
    Fault(QueryFault),
}

/// Entries matching a query at the moment incremental evaluation started.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CqResults {
    pub entries: Vec<(String, AttributeValue)>,
    /// Entries the predicate faulted on; they are not members
    pub faults: Vec<QueryFault>,
}

impl CqResults {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }
}

struct CqInner {
    state: CqState,
    members: BTreeSet<String>,
    listeners: Vec<Arc<dyn EventListener>>,
    stats: CqStatistics,
}

pub struct ContinuousQuery {
    session: String,
    name: String,
    durable: bool,
    predicate: Arc<dyn Predicate>,
    inner: Mutex<CqInner>,
}

impl ContinuousQuery {
    pub fn new(
        session: impl Into<String>,
        name: impl Into<String>,
        predicate: Arc<dyn Predicate>,
        durable: bool,
    ) -> Self {
        Self {
            session: session.into(),
            name: name.into(),
            durable,
            predicate,
            inner: Mutex::new(CqInner {
                state: CqState::Idle,
                members: BTreeSet::new(),
                listeners: Vec::new(),
                stats: CqStatistics::default(),
            }),
        }
    }

    /// A durable query rebuilt from a session record: running, with its
    /// recorded membership, and no listeners until the client attaches them.
    pub fn restored(
        session: impl Into<String>,
        name: impl Into<String>,
        condition: Condition,
        members: impl IntoIterator<Item = String>,
    ) -> Self {
        let query = Self::new(session, name, Arc::new(condition), true);
        {
            let mut inner = query.lock();
            inner.state = CqState::Running;
            inner.members = members.into_iter().collect();
        }
        query
    }

    fn lock(&self) -> MutexGuard<'_, CqInner> {
        self.inner.lock().expect("continuous query mutex poisoned")
    }

    pub fn session(&self) -> &str {
        &self.session
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn condition(&self) -> Option<&Condition> {
        self.predicate.as_condition()
    }

    pub fn state(&self) -> CqState {
        self.lock().state
    }

    pub fn statistics(&self) -> CqStatistics {
        self.lock().stats
    }

    pub fn matching_keys(&self) -> Vec<String> {
        self.lock().members.iter().cloned().collect()
    }

    pub fn add_listener(&self, listener: Arc<dyn EventListener>) -> CacheResult<()> {
        let mut inner = self.lock();
        if inner.state == CqState::Closed {
            return Err(self.closed_error("add a listener to"));
        }
        inner.listeners.push(listener);
        Ok(())
    }

    pub fn listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.lock().listeners.clone()
    }

    /// Compute the membership baseline from `entries` and start incremental
    /// evaluation. Callers make this atomic with respect to mutations by
    /// running it while the dataset's mutation lock is held.
    pub fn start<'a, I>(&self, entries: I) -> CacheResult<CqResults>
    where
        I: IntoIterator<Item = (&'a str, &'a AttributeValue)>,
    {
        let mut inner = self.lock();
        match inner.state {
            CqState::Idle | CqState::Stopped => {}
            state => {
                return Err(CacheError::invalid_state(format!(
                    "continuous query '{}' cannot execute while {state}",
                    self.name
                )))
            }
        }

        let mut results = CqResults::default();
        let mut members = BTreeSet::new();
        for (key, value) in entries {
            match self.predicate.evaluate(key, value) {
                Ok(true) => {
                    members.insert(key.to_string());
                    results.entries.push((key.to_string(), value.clone()));
                }
                Ok(false) => {}
                Err(message) => results.faults.push(self.fault(key, message)),
            }
        }
        results.entries.sort_by(|a, b| a.0.cmp(&b.0));

        inner.stats.faults += results.faults.len() as u64;
        inner.members = members;
        inner.state = CqState::Running;
        drop(inner);

        log::debug!(
            "[{}] continuous query '{}' running with {} initial result(s)",
            self.session,
            self.name,
            results.len()
        );
        Ok(results)
    }

    pub fn stop(&self) -> CacheResult<()> {
        let mut inner = self.lock();
        if inner.state != CqState::Running {
            return Err(CacheError::invalid_state(format!(
                "continuous query '{}' cannot stop while {}",
                self.name, inner.state
            )));
        }
        inner.state = CqState::Stopped;
        log::debug!("[{}] continuous query '{}' stopped", self.session, self.name);
        Ok(())
    }

    /// Move to CLOSED and notify each listener's `on_close` exactly once.
    /// Closing a closed query does nothing. Returns whether this call closed
    /// the query.
    pub fn close(&self) -> bool {
        match self.close_collecting() {
            Some(failures) => {
                for failure in failures {
                    log::warn!(
                        "[{}] on_close of continuous query '{}' panicked: {failure}",
                        self.session,
                        self.name
                    );
                }
                true
            }
            None => false,
        }
    }

    /// Close and return the panic messages of `on_close` callbacks that
    /// failed, or `None` when the query was already closed. A panicking
    /// listener does not keep the others from being notified.
    pub(crate) fn close_collecting(&self) -> Option<Vec<String>> {
        let listeners = {
            let mut inner = self.lock();
            if inner.state == CqState::Closed {
                return None;
            }
            inner.state = CqState::Closed;
            inner.members.clear();
            std::mem::take(&mut inner.listeners)
        };
        let failures = listeners
            .iter()
            .filter_map(|listener| guarded(|| listener.on_close()).err())
            .collect();
        log::debug!("[{}] continuous query '{}' closed", self.session, self.name);
        Some(failures)
    }

    /// Determine the delta a mutation causes for this query.
    pub fn evaluate(&self, mutation: &Mutation) -> Evaluation {
        let mut inner = self.lock();
        if inner.state != CqState::Running {
            return Evaluation::Inactive;
        }

        let was_member = inner.members.contains(&mutation.key);
        let is_member = match &mutation.new_value {
            None => false,
            Some(value) => match self.predicate.evaluate(&mutation.key, value) {
                Ok(matches) => matches,
                Err(message) => {
                    inner.stats.faults += 1;
                    return Evaluation::Fault(self.fault(&mutation.key, message));
                }
            },
        };

        let (operation, old_value, new_value) = match (was_member, is_member) {
            (false, true) => {
                inner.members.insert(mutation.key.clone());
                inner.stats.inserts += 1;
                (Operation::Create, None, mutation.new_value.clone())
            }
            (true, true) if mutation.old_value != mutation.new_value => {
                inner.stats.updates += 1;
                (
                    Operation::Update,
                    mutation.old_value.clone(),
                    mutation.new_value.clone(),
                )
            }
            (true, false) => {
                inner.members.remove(&mutation.key);
                inner.stats.deletes += 1;
                (Operation::Destroy, mutation.old_value.clone(), None)
            }
            _ => return Evaluation::NoChange,
        };
        inner.stats.events += 1;

        Evaluation::Delta(CacheEvent::new(
            mutation.key.clone(),
            old_value,
            new_value,
            operation,
            EventSource::Query(self.name.clone()),
        ))
    }

    /// Hand an evaluation fault to every listener's `on_error`. Returns the
    /// panic messages of listeners that failed.
    pub fn notify_fault(&self, fault: &QueryFault) -> Vec<String> {
        self.listeners()
            .iter()
            .filter_map(|listener| guarded(|| listener.on_error(fault)).err())
            .collect()
    }

    fn fault(&self, key: &str, message: String) -> QueryFault {
        QueryFault {
            session: self.session.clone(),
            query: self.name.clone(),
            key: key.to_string(),
            message,
        }
    }

    fn closed_error(&self, action: &str) -> CacheError {
        CacheError::invalid_state(format!(
            "cannot {action} continuous query '{}': it is closed",
            self.name
        ))
    }
}

impl fmt::Debug for ContinuousQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("ContinuousQuery")
            .field("session", &self.session)
            .field("name", &self.name)
            .field("durable", &self.durable)
            .field("state", &inner.state)
            .field("members", &inner.members.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
