// SPDX-License-Identifier: MIT OR Apache-2.0

//! Typed engine configuration.
//!
//! ```toml
//! durable-timeout = "300s"
//! subscription-queue-capacity = 10000
//! expiry-sweep-interval = "1s"
//! auto-dispatch = true
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, Instant};

use super::flat_config::{FlatConfig, PropertySource};
use crate::core::error::{CacheError, CacheResult};
use crate::core::util::duration::{self, format_duration, parse_duration};

pub const DURABLE_TIMEOUT: &str = "durable-timeout";
pub const QUEUE_CAPACITY: &str = "subscription-queue-capacity";
pub const EXPIRY_SWEEP_INTERVAL: &str = "expiry-sweep-interval";
pub const AUTO_DISPATCH: &str = "auto-dispatch";
pub const DISPATCH_WAIT: &str = "dispatch-wait";
pub const LAG_WARNING_THRESHOLD: &str = "lag-warning-threshold";
pub const CHECKPOINT_ON_ENQUEUE: &str = "checkpoint-on-enqueue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct EngineConfig {
    /// Retention of a durable session's queue after a keep-alive close,
    /// unless the session supplies its own timeout on connect
    #[serde(with = "duration::serde_str")]
    pub durable_timeout: Duration,

    /// Maximum undelivered events per session; `None` is unbounded
    #[serde(rename = "subscription-queue-capacity")]
    pub queue_capacity: Option<usize>,

    /// How often the background reaper looks for overdue durable sessions
    #[serde(with = "duration::serde_str")]
    pub expiry_sweep_interval: Duration,

    /// Start a delivery worker per session once it is ready for events
    pub auto_dispatch: bool,

    /// How long a delivery worker blocks on an empty queue before re-checking
    /// for shutdown
    #[serde(with = "duration::serde_str")]
    pub dispatch_wait: Duration,

    /// Queue depth at which a session counts as lagging
    pub lag_warning_threshold: u64,

    /// Rewrite a disconnected durable session's record on every enqueue
    pub checkpoint_on_enqueue: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            durable_timeout: Duration::from_secs(300),
            queue_capacity: None,
            expiry_sweep_interval: Duration::from_secs(1),
            auto_dispatch: false,
            dispatch_wait: Duration::from_millis(100),
            lag_warning_threshold: 1000,
            checkpoint_on_enqueue: true,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> CacheResult<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| CacheError::configuration(format!("invalid TOML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(content: &str) -> CacheResult<Self> {
        let config: EngineConfig = serde_yaml::from_str(content)
            .map_err(|e| CacheError::configuration(format!("invalid YAML configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml`, `.yaml` or `.yml` file.
    pub fn from_file(path: impl AsRef<Path>) -> CacheResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            other => Err(CacheError::configuration(format!(
                "unsupported configuration file extension {other:?} for {}",
                path.display()
            ))),
        }
    }

    /// Build from flat properties, starting from defaults for absent keys.
    pub fn from_flat_config(config: &FlatConfig) -> CacheResult<Self> {
        let mut engine = EngineConfig::default();

        if let Some(value) = config.get(DURABLE_TIMEOUT) {
            engine.durable_timeout = parse_duration_key(DURABLE_TIMEOUT, value)?;
        }
        if let Some(value) = config.get(QUEUE_CAPACITY) {
            engine.queue_capacity = match value.trim().to_lowercase().as_str() {
                "unbounded" | "0" => None,
                raw => Some(raw.parse::<usize>().map_err(|_| {
                    CacheError::configuration_with_key(
                        format!("expected a positive integer or 'unbounded', got '{value}'"),
                        QUEUE_CAPACITY,
                    )
                })?),
            };
        }
        if let Some(value) = config.get(EXPIRY_SWEEP_INTERVAL) {
            engine.expiry_sweep_interval = parse_duration_key(EXPIRY_SWEEP_INTERVAL, value)?;
        }
        if let Some(value) = config.get(AUTO_DISPATCH) {
            engine.auto_dispatch = parse_bool_key(AUTO_DISPATCH, value)?;
        }
        if let Some(value) = config.get(DISPATCH_WAIT) {
            engine.dispatch_wait = parse_duration_key(DISPATCH_WAIT, value)?;
        }
        if let Some(value) = config.get(LAG_WARNING_THRESHOLD) {
            engine.lag_warning_threshold = value.trim().parse().map_err(|_| {
                CacheError::configuration_with_key(
                    format!("expected an integer, got '{value}'"),
                    LAG_WARNING_THRESHOLD,
                )
            })?;
        }
        if let Some(value) = config.get(CHECKPOINT_ON_ENQUEUE) {
            engine.checkpoint_on_enqueue = parse_bool_key(CHECKPOINT_ON_ENQUEUE, value)?;
        }

        engine.validate()?;
        Ok(engine)
    }

    /// Flatten into properties tagged with `source`, for layering.
    pub fn to_flat_config(&self, source: PropertySource) -> FlatConfig {
        let mut config = FlatConfig::new();
        config.set(DURABLE_TIMEOUT, format_duration(self.durable_timeout), source);
        config.set(
            QUEUE_CAPACITY,
            self.queue_capacity
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
            source,
        );
        config.set(
            EXPIRY_SWEEP_INTERVAL,
            format_duration(self.expiry_sweep_interval),
            source,
        );
        config.set(AUTO_DISPATCH, self.auto_dispatch.to_string(), source);
        config.set(DISPATCH_WAIT, format_duration(self.dispatch_wait), source);
        config.set(
            LAG_WARNING_THRESHOLD,
            self.lag_warning_threshold.to_string(),
            source,
        );
        config.set(
            CHECKPOINT_ON_ENQUEUE,
            self.checkpoint_on_enqueue.to_string(),
            source,
        );
        config
    }

    /// Overlay programmatic properties on top of this configuration.
    pub fn with_properties(&self, properties: &FlatConfig) -> CacheResult<Self> {
        let mut layered = self.to_flat_config(PropertySource::ConfigFile);
        layered.merge(properties);
        Self::from_flat_config(&layered)
    }

    pub fn validate(&self) -> CacheResult<()> {
        if self.queue_capacity == Some(0) {
            return Err(CacheError::configuration_with_key(
                "queue capacity must be positive; omit it for an unbounded queue",
                QUEUE_CAPACITY,
            ));
        }
        if self.expiry_sweep_interval.is_zero() {
            return Err(CacheError::configuration_with_key(
                "expiry sweep interval must be non-zero",
                EXPIRY_SWEEP_INTERVAL,
            ));
        }
        if self.dispatch_wait.is_zero() {
            return Err(CacheError::configuration_with_key(
                "dispatch wait must be non-zero",
                DISPATCH_WAIT,
            ));
        }
        let now = Instant::now();
        if now.checked_add(self.expiry_sweep_interval).is_none() {
            return Err(CacheError::configuration_with_key(
                format!("expiry sweep interval {:?} is too long", self.expiry_sweep_interval),
                EXPIRY_SWEEP_INTERVAL,
            ));
        }
        if now.checked_add(self.dispatch_wait).is_none() {
            return Err(CacheError::configuration_with_key(
                format!("dispatch wait {:?} is too long", self.dispatch_wait),
                DISPATCH_WAIT,
            ));
        }
        Ok(())
    }
}

fn parse_duration_key(key: &str, value: &str) -> CacheResult<Duration> {
    parse_duration(value).map_err(|e| CacheError::configuration_with_key(e, key))
}

fn parse_bool_key(key: &str, value: &str) -> CacheResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(CacheError::configuration_with_key(
            format!("expected true/false, got '{value}'"),
            key,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.durable_timeout, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            durable-timeout = "60s"
            subscription-queue-capacity = 128
            auto-dispatch = true
            "#,
        )
        .unwrap();
        assert_eq!(config.durable_timeout, Duration::from_secs(60));
        assert_eq!(config.queue_capacity, Some(128));
        assert!(config.auto_dispatch);
        assert_eq!(config.expiry_sweep_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_from_yaml() {
        let config = EngineConfig::from_yaml_str(
            "durable-timeout: 2m\nexpiry-sweep-interval: 250ms\nlag-warning-threshold: 10\n",
        )
        .unwrap();
        assert_eq!(config.durable_timeout, Duration::from_secs(120));
        assert_eq!(config.expiry_sweep_interval, Duration::from_millis(250));
        assert_eq!(config.lag_warning_threshold, 10);
    }

    #[test]
    fn test_invalid_duration_in_toml() {
        let result = EngineConfig::from_toml_str("durable-timeout = \"soon\"");
        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }

    #[test]
    fn test_out_of_range_duration_is_configuration_error() {
        let result = EngineConfig::from_toml_str("durable-timeout = \"18446744073709551615h\"");
        assert!(matches!(result, Err(CacheError::Configuration { .. })));
    }

    #[test]
    fn test_unschedulable_intervals_fail_validation() {
        let config = EngineConfig {
            expiry_sweep_interval: Duration::MAX,
            ..Default::default()
        };
        match config.validate() {
            Err(CacheError::Configuration { config_key, .. }) => {
                assert_eq!(config_key.as_deref(), Some(EXPIRY_SWEEP_INTERVAL));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
        let config = EngineConfig {
            dispatch_wait: Duration::MAX,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_properties() {
        let mut props = FlatConfig::new();
        props.set(DURABLE_TIMEOUT, "300s", PropertySource::Programmatic);
        props.set(QUEUE_CAPACITY, "unbounded", PropertySource::Programmatic);
        props.set(AUTO_DISPATCH, "yes", PropertySource::Programmatic);
        let config = EngineConfig::from_flat_config(&props).unwrap();
        assert_eq!(config.durable_timeout, Duration::from_secs(300));
        assert_eq!(config.queue_capacity, None);
        assert!(config.auto_dispatch);
    }

    #[test]
    fn test_programmatic_properties_override_file() {
        let file = EngineConfig::from_toml_str("durable-timeout = \"10m\"\nauto-dispatch = true").unwrap();
        let mut props = FlatConfig::new();
        props.set(DURABLE_TIMEOUT, "30s", PropertySource::Programmatic);
        let config = file.with_properties(&props).unwrap();
        assert_eq!(config.durable_timeout, Duration::from_secs(30));
        assert!(config.auto_dispatch);
    }

    #[test]
    fn test_bad_property_names_key() {
        let mut props = FlatConfig::new();
        props.set(AUTO_DISPATCH, "maybe", PropertySource::Programmatic);
        match EngineConfig::from_flat_config(&props) {
            Err(CacheError::Configuration { config_key, .. }) => {
                assert_eq!(config_key.as_deref(), Some(AUTO_DISPATCH));
            }
            other => panic!("expected configuration error, got {other:?}"),
        }
    }
}
