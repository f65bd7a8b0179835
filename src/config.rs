//! Agent configuration.
//!
//! A deployment passes settings as JSON via the `FJ_AGENT_CONFIG`
//! environment variable; individual fields can be overridden with
//! `FJ_AGENT_*` variables. Everything has a default, so the agent also
//! starts bare.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration for the agent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stable identifier of this agent, embedded into every subject.
    pub agent_id: String,

    /// Bus URL, for transports that need one. Loopback mode ignores it.
    pub bus_url: String,

    /// Fixed interval between bus connect attempts, in milliseconds.
    /// The interval does not grow.
    pub connect_interval_ms: u64,

    /// Stdout read chunk size in bytes.
    pub chunk_size: usize,

    /// Depth of the connector's dispatch queue.
    pub dispatch_queue_depth: usize,

    /// Cap on concurrently in-flight RPC requests.
    pub max_inflight_requests: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: "agent".to_string(),
            bus_url: "bus://localhost".to_string(),
            connect_interval_ms: 1000,
            chunk_size: 4096,
            dispatch_queue_depth: 1024,
            max_inflight_requests: 256,
        }
    }
}

impl Config {
    /// Load from `FJ_AGENT_CONFIG` (JSON), then apply `FJ_AGENT_*`
    /// overrides. An unset `FJ_AGENT_CONFIG` yields the defaults.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("FJ_AGENT_CONFIG") {
            Ok(json) => {
                serde_json::from_str(&json).context("Failed to parse FJ_AGENT_CONFIG")?
            }
            Err(_) => Self::default(),
        };

        if let Ok(agent_id) = std::env::var("FJ_AGENT_ID") {
            config.agent_id = agent_id;
        }
        if let Ok(url) = std::env::var("FJ_AGENT_BUS_URL") {
            config.bus_url = url;
        }

        Ok(config)
    }

    pub const fn connect_interval(&self) -> Duration {
        Duration::from_millis(self.connect_interval_ms)
    }

    /// Create a config from a JSON string (for testing).
    #[cfg(test)]
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse JSON")
    }
}
