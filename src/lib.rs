// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable subscription and continuous query delivery engine.
//!
//! The crate tracks client sessions, key interests and continuous queries
//! against a keyed dataset, queues change events per session (retained across
//! a keep-alive disconnect up to a timeout) and delivers them in sequence order
//! to registered listeners once the client signals it is ready for events.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use cqflux::core::config::EngineConfig;
//! use cqflux::core::dataset::InMemoryDataset;
//! use cqflux::core::engine::SubscriptionEngine;
//!
//! let dataset = Arc::new(InMemoryDataset::new());
//! let engine = SubscriptionEngine::new(EngineConfig::default(), dataset.clone())?;
//! dataset.set_mutation_listener(&engine);
//!
//! engine.connect("DurableClientId", true, None)?;
//! engine.register_keys("DurableClientId", &["Key-1"], true)?;
//! engine.mark_ready("DurableClientId")?;
//! dataset.put("Key-1", 42i64);
//! engine.dispatch("DurableClientId")?;
//! ```

pub mod core;
