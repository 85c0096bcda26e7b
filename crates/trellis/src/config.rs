//! Topology manager configuration.
//!
//! Every option is required. There are no implicit defaults: a manager built
//! from an incomplete configuration refuses to start rather than guess.

use std::time::Duration;

use serde::Deserialize;
use trellis_core::Keypair;

use crate::error::ConfigError;

/// Configuration for a [`TopologyManager`](crate::TopologyManager).
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    /// Quiet period after the last ring change before reconciling.
    pub debounce_reset_connections: Duration,
    /// Period of the background reconciliation pass.
    pub reset_connection_interval: Duration,
    /// Consecutive dial failures after which a peer should be evicted.
    pub max_unreachable_before_eviction: u32,
    /// Identity of the local node.
    pub keys: Keypair,
}

impl TopologyConfig {
    pub fn builder() -> TopologyConfigBuilder {
        TopologyConfigBuilder::default()
    }

    /// Parse the timing options from a JSON document.
    ///
    /// Recognized fields are `debounce_reset_connections_ms`,
    /// `reset_connection_interval_ms` and `max_unreachable_before_eviction`.
    /// Keys are never read from configuration text.
    pub fn from_json(text: &str, keys: Keypair) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        TopologyConfigBuilder {
            debounce_reset_connections: raw.debounce_reset_connections_ms.map(Duration::from_millis),
            reset_connection_interval: raw.reset_connection_interval_ms.map(Duration::from_millis),
            max_unreachable_before_eviction: raw.max_unreachable_before_eviction,
            keys: Some(keys),
        }
        .build()
    }

    /// Check that the values are usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reset_connection_interval.is_zero() {
            return Err(ConfigError::Invalid {
                field: "reset_connection_interval",
                reason: "must be greater than zero".into(),
            });
        }
        if self.max_unreachable_before_eviction == 0 {
            return Err(ConfigError::Invalid {
                field: "max_unreachable_before_eviction",
                reason: "must be at least 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    debounce_reset_connections_ms: Option<u64>,
    reset_connection_interval_ms: Option<u64>,
    max_unreachable_before_eviction: Option<u32>,
}

/// Builder for [`TopologyConfig`].
#[derive(Debug, Default)]
pub struct TopologyConfigBuilder {
    debounce_reset_connections: Option<Duration>,
    reset_connection_interval: Option<Duration>,
    max_unreachable_before_eviction: Option<u32>,
    keys: Option<Keypair>,
}

impl TopologyConfigBuilder {
    pub fn debounce_reset_connections(mut self, delay: Duration) -> Self {
        self.debounce_reset_connections = Some(delay);
        self
    }

    pub fn reset_connection_interval(mut self, period: Duration) -> Self {
        self.reset_connection_interval = Some(period);
        self
    }

    pub fn max_unreachable_before_eviction(mut self, count: u32) -> Self {
        self.max_unreachable_before_eviction = Some(count);
        self
    }

    pub fn keys(mut self, keys: Keypair) -> Self {
        self.keys = Some(keys);
        self
    }

    pub fn build(self) -> Result<TopologyConfig, ConfigError> {
        let config = TopologyConfig {
            debounce_reset_connections: self
                .debounce_reset_connections
                .ok_or(ConfigError::Missing("debounce_reset_connections"))?,
            reset_connection_interval: self
                .reset_connection_interval
                .ok_or(ConfigError::Missing("reset_connection_interval"))?,
            max_unreachable_before_eviction: self
                .max_unreachable_before_eviction
                .ok_or(ConfigError::Missing("max_unreachable_before_eviction"))?,
            keys: self.keys.ok_or(ConfigError::Missing("keys"))?,
        };
        config.validate()?;
        Ok(config)
    }
}
