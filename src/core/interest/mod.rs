// SPDX-License-Identifier: MIT OR Apache-2.0

//! Key, regex and all-keys interest registered by client sessions.

pub mod interest_registry;

pub use interest_registry::{Interest, InterestPattern, InterestRegistry};
