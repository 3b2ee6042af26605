// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod cache_event;
pub mod value;

pub use cache_event::{CacheEvent, EventSource, Mutation, MutationKind, Operation};
pub use value::AttributeValue;
