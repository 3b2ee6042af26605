// SPDX-License-Identifier: MIT OR Apache-2.0

pub mod engine_config;
pub mod flat_config;

pub use engine_config::EngineConfig;
pub use flat_config::{FlatConfig, PropertySource};
