// SPDX-License-Identifier: MIT OR Apache-2.0

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{CacheError, CacheResult};
use crate::core::interest::Interest;
use crate::core::query::Condition;
use crate::core::queue::QueueSnapshot;
use crate::core::util::{from_bytes, to_bytes};

/// Bumped whenever the record layout changes
pub const RECORD_VERSION: u32 = 1;

/// A durable continuous query as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableQueryRecord {
    pub name: String,
    pub condition: Condition,
    /// Keys matching at save time, so deltas resume from the right baseline
    pub matching_keys: Vec<String>,
}

/// Write-ahead record of one durable session, keyed by session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableSessionRecord {
    pub version: u32,
    pub session_id: String,
    pub durable: bool,
    pub timeout_ms: u64,
    pub queue: QueueSnapshot,
    pub interests: Vec<Interest>,
    pub queries: Vec<DurableQueryRecord>,
    /// Milliseconds since the epoch
    pub saved_at: i64,
}

impl DurableSessionRecord {
    pub fn new(
        session_id: impl Into<String>,
        timeout: Duration,
        queue: QueueSnapshot,
        interests: Vec<Interest>,
        queries: Vec<DurableQueryRecord>,
    ) -> Self {
        Self {
            version: RECORD_VERSION,
            session_id: session_id.into(),
            durable: true,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            queue,
            interests,
            queries,
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Last sequence number the client confirmed
    pub fn last_acknowledged(&self) -> u64 {
        self.queue.last_acknowledged
    }

    pub fn pending_events(&self) -> usize {
        self.queue.events.len()
    }

    pub fn encode(&self) -> CacheResult<Vec<u8>> {
        to_bytes(self).map_err(|e| {
            CacheError::persistence_with_source(
                format!("failed to encode record for session '{}'", self.session_id),
                e,
            )
        })
    }

    pub fn decode(bytes: &[u8]) -> CacheResult<Self> {
        let record: DurableSessionRecord = from_bytes(bytes)
            .map_err(|e| CacheError::persistence_with_source("failed to decode session record", e))?;
        if record.version != RECORD_VERSION {
            return Err(CacheError::persistence(format!(
                "session record for '{}' has version {}, expected {RECORD_VERSION}",
                record.session_id, record.version
            )));
        }
        Ok(record)
    }
}
