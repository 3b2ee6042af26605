// SPDX-License-Identifier: MIT OR Apache-2.0

//! Consumer-side duplicate and gap detection over per-session sequence numbers.

/// Classification of an observed sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    /// Exactly the next expected number
    Fresh,
    /// Already seen; a redelivery to skip
    Duplicate,
    /// Newer than expected; `expected` was the first missing number
    Gap { expected: u64 },
}

/// Tracks the highest sequence number seen for one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SequenceTracker {
    last_seen: u64,
}

impl SequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resume after `last_seen` (e.g. the last acknowledged number).
    pub fn starting_after(last_seen: u64) -> Self {
        Self { last_seen }
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn observe(&mut self, sequence: u64) -> SequenceCheck {
        if sequence <= self.last_seen {
            return SequenceCheck::Duplicate;
        }
        let expected = self.last_seen + 1;
        self.last_seen = sequence;
        if sequence == expected {
            SequenceCheck::Fresh
        } else {
            SequenceCheck::Gap { expected }
        }
    }
}
