// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};
use std::fmt;

use super::value::AttributeValue;

/// Kind of mutation applied to the backing dataset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MutationKind {
    Create,
    Update,
    Destroy,
}

/// Operation carried by a delivered event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Update,
    Destroy,
}

impl Operation {
    #[inline]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Destroy => "DESTROY",
        }
    }
}

impl From<MutationKind> for Operation {
    fn from(kind: MutationKind) -> Self {
        match kind {
            MutationKind::Create => Operation::Create,
            MutationKind::Update => Operation::Update,
            MutationKind::Destroy => Operation::Destroy,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Subscription that produced an event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// Key, regex or all-keys interest registered on the session
    Interest,
    /// Named continuous query owned by the session
    Query(String),
}

/// A single mutation notification from the dataset.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub key: String,
    pub old_value: Option<AttributeValue>,
    pub new_value: Option<AttributeValue>,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<AttributeValue>,
        new_value: Option<AttributeValue>,
        kind: MutationKind,
    ) -> Self {
        Self {
            key: key.into(),
            old_value,
            new_value,
            kind,
        }
    }
}

/// Event queued for one session.
///
/// `sequence` is zero until the event store assigns the session's next
/// sequence number at enqueue time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEvent {
    pub sequence: u64,
    pub key: String,
    pub old_value: Option<AttributeValue>,
    pub new_value: Option<AttributeValue>,
    pub operation: Operation,
    pub source: EventSource,
    /// Milliseconds since the epoch when the event was produced
    pub timestamp: i64,
}

impl CacheEvent {
    pub fn new(
        key: impl Into<String>,
        old_value: Option<AttributeValue>,
        new_value: Option<AttributeValue>,
        operation: Operation,
        source: EventSource,
    ) -> Self {
        Self {
            sequence: 0,
            key: key.into(),
            old_value,
            new_value,
            operation,
            source,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Interest event mirroring a dataset mutation one-to-one.
    pub fn from_mutation(mutation: &Mutation) -> Self {
        Self::new(
            mutation.key.clone(),
            mutation.old_value.clone(),
            mutation.new_value.clone(),
            mutation.kind.into(),
            EventSource::Interest,
        )
    }

    /// Name of the continuous query this event belongs to, if any.
    pub fn query_name(&self) -> Option<&str> {
        match &self.source {
            EventSource::Query(name) => Some(name),
            EventSource::Interest => None,
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} {}({}", self.sequence, self.operation, self.key)?;
        if let Some(value) = &self.new_value {
            write!(f, ", {value}")?;
        }
        write!(f, ")")
    }
}
