// SPDX-License-Identifier: MIT OR Apache-2.0

//! Fault reporting for errors that are recovered locally.
//!
//! Producer-side drops, continuous query evaluation faults, listener faults and
//! persistence failures never propagate to the caller that triggered them.
//! They are turned into [`Fault`] records and handed to a [`FaultReporter`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Where a fault originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Mutation notification could not be turned into a queued event
    Producer,
    /// Continuous query predicate failed for one mutation
    Query,
    /// Application listener returned an error or panicked
    Listener,
    /// Durable session record could not be written or read
    Persistence,
}

impl FaultKind {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Producer => "producer",
            FaultKind::Query => "query",
            FaultKind::Listener => "listener",
            FaultKind::Persistence => "persistence",
        }
    }
}

/// A recovered fault
#[derive(Debug, Clone)]
pub struct Fault {
    pub kind: FaultKind,
    pub session: Option<String>,
    /// Continuous query name, when the fault is scoped to one query
    pub query: Option<String>,
    /// Sequence number of the affected event, if it had one
    pub sequence: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl Fault {
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            session: None,
            query: None,
            sequence: None,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.kind.as_str())?;
        if let Some(session) = &self.session {
            write!(f, " session={session}")?;
        }
        if let Some(query) = &self.query {
            write!(f, " query={query}")?;
        }
        if let Some(sequence) = self.sequence {
            write!(f, " seq={sequence}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Sink for recovered faults
pub trait FaultReporter: Send + Sync {
    fn report(&self, fault: Fault);
}

/// Reports faults through the `log` facade only.
#[derive(Debug, Default)]
pub struct LoggingFaultReporter;

impl FaultReporter for LoggingFaultReporter {
    fn report(&self, fault: Fault) {
        match fault.kind {
            FaultKind::Persistence => log::error!("{fault}"),
            _ => log::warn!("{fault}"),
        }
    }
}

/// Logs faults and keeps the most recent ones for inspection.
#[derive(Debug)]
pub struct FaultCollector {
    recent: Mutex<VecDeque<Fault>>,
    retain: usize,
    total: AtomicU64,
}

impl FaultCollector {
    pub fn new(retain: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(retain.min(1024))),
            retain: retain.max(1),
            total: AtomicU64::new(0),
        }
    }

    /// Total faults reported since creation
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn recent(&self) -> Vec<Fault> {
        self.recent
            .lock()
            .expect("fault collector poisoned")
            .iter()
            .cloned()
            .collect()
    }

    pub fn count_of(&self, kind: FaultKind) -> usize {
        self.recent
            .lock()
            .expect("fault collector poisoned")
            .iter()
            .filter(|f| f.kind == kind)
            .count()
    }
}

impl Default for FaultCollector {
    fn default() -> Self {
        Self::new(256)
    }
}

impl FaultReporter for FaultCollector {
    fn report(&self, fault: Fault) {
        LoggingFaultReporter.report(fault.clone());
        self.total.fetch_add(1, Ordering::Relaxed);
        let mut recent = self.recent.lock().expect("fault collector poisoned");
        if recent.len() == self.retain {
            recent.pop_front();
        }
        recent.push_back(fault);
    }
}
