// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod config;
pub mod dataset;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod event;
pub mod interest;
pub mod listener;
pub mod persistence;
pub mod query;
pub mod queue;
pub mod session;
pub mod transport;
pub mod util;

pub use engine::SubscriptionEngine;
pub use error::{CacheError, CacheResult};
pub use event::{AttributeValue, CacheEvent, EventSource, MutationKind, Operation};
