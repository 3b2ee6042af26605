// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod event_queue;
pub mod queue_store;
pub mod sequence;

pub use event_queue::{Drain, EventQueue, QueueSnapshot};
pub use queue_store::{EnqueueOutcome, EventQueueStore, SubscriptionLookup};
pub use sequence::{SequenceCheck, SequenceTracker};
