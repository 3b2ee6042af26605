// SPDX-License-Identifier: MIT OR Apache-2.0

//! # Layered Property Configuration
//!
//! Engine settings can come from built-in defaults, a configuration file, or
//! programmatic properties handed to the engine by the application (the
//! `durable-client-id` / `durable-timeout` style of a cache client). Layers
//! are merged by [`PropertySource`] priority.
//!
//! ## Configuration Sources (Priority: Low to High)
//!
//! 1. **Default** - Built-in Rust defaults
//! 2. **ConfigFile** - TOML or YAML engine configuration
//! 3. **Programmatic** - Properties supplied in code (highest priority)

use std::collections::HashMap;

/// Property source identifier with priority ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertySource {
    /// Rust code defaults (priority: 0)
    Default,
    /// TOML/YAML configuration file (priority: 1)
    ConfigFile,
    /// Properties set by the application (priority: 2)
    Programmatic,
}

impl PropertySource {
    /// Get numeric priority for comparison (higher = more important)
    #[inline]
    pub const fn priority(&self) -> u8 {
        match self {
            PropertySource::Default => 0,
            PropertySource::ConfigFile => 1,
            PropertySource::Programmatic => 2,
        }
    }

    #[inline]
    pub const fn description(&self) -> &'static str {
        match self {
            PropertySource::Default => "Rust default",
            PropertySource::ConfigFile => "configuration file",
            PropertySource::Programmatic => "programmatic property",
        }
    }
}

/// Flat key-value configuration with source tracking
#[derive(Debug, Clone)]
pub struct FlatConfig {
    properties: HashMap<String, String>,
    sources: HashMap<String, PropertySource>,
}

impl FlatConfig {
    #[inline]
    pub fn new() -> Self {
        Self {
            properties: HashMap::new(),
            sources: HashMap::new(),
        }
    }

    /// Set a property with source tracking and priority-based override
    ///
    /// A value from a lower-priority source never replaces one from a higher
    /// priority source. The same source may overwrite its own value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, source: PropertySource) {
        let key = key.into();

        if let Some(existing_source) = self.sources.get(&key) {
            if existing_source.priority() > source.priority() {
                return;
            }
        }

        self.properties.insert(key.clone(), value.into());
        self.sources.insert(key, source);
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&String> {
        self.properties.get(key)
    }

    /// Get a property value with its source
    #[inline]
    pub fn get_with_source(&self, key: &str) -> Option<(&String, PropertySource)> {
        self.properties
            .get(key)
            .and_then(|value| self.sources.get(key).map(|source| (value, *source)))
    }

    #[inline]
    pub fn contains(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    #[inline]
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.properties.keys()
    }

    /// Merge another configuration into this one (respects priorities)
    pub fn merge(&mut self, other: &FlatConfig) {
        for (key, value) in &other.properties {
            if let Some(source) = other.sources.get(key) {
                self.set(key.clone(), value.clone(), *source);
            }
        }
    }

    /// Get all properties with a specific prefix
    pub fn get_properties_with_prefix<'a>(
        &'a self,
        prefix: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a String)> + 'a {
        self.properties
            .iter()
            .filter(move |(key, _)| key.starts_with(prefix))
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.properties.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}

impl Default for FlatConfig {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}
