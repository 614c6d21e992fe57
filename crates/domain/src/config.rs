use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PoolConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Overall timeout for the initial connect of each node.
    /// `None` retries until connected or shut down.
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
}

impl PoolConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: PoolConfig = toml::from_str(&raw)?;
        tracing::debug!(
            path = %path.as_ref().display(),
            nodes = config.nodes.len(),
            "loaded pool config"
        );
        Ok(config)
    }

    /// Reject configs that cannot produce a working pool.
    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(Error::Config("at least one [[nodes]] entry is required".into()));
        }
        for node in &self.nodes {
            if node.host.trim().is_empty() {
                return Err(Error::Config("node host must not be empty".into()));
            }
            if node.num_shards == 0 {
                return Err(Error::Config(format!(
                    "node {}: num_shards must be at least 1",
                    node.display_name()
                )));
            }
        }
        if self.reconnect.backoff_factor < 1.0 {
            return Err(Error::Config("reconnect.backoff_factor must be >= 1.0".into()));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(Error::Config("reconnect.jitter must be between 0.0 and 1.0".into()));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(Error::Config(
                "reconnect.initial_delay_ms must not exceed reconnect.max_delay_ms".into(),
            ));
        }
        Ok(())
    }

    /// Apply a password override (e.g. from `LAVALINK_PASSWORD`) to every node.
    pub fn override_password(&mut self, password: &str) {
        for node in &mut self.nodes {
            node.password = password.to_string();
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-node connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Display name used in logs. Defaults to `host:port`.
    #[serde(default)]
    pub name: Option<String>,
    pub host: String,
    #[serde(default = "d_port")]
    pub port: u16,
    /// Shared secret sent as the `Authorization` header.
    #[serde(default = "d_password")]
    pub password: String,
    /// Client identity sent as the `User-Id` header.
    pub user_id: u64,
    #[serde(default = "d_1")]
    pub num_shards: u32,
}

impl NodeConfig {
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("{}:{}", self.host, self.port))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Reconnect policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "d_1000")]
    pub initial_delay_ms: u64,
    #[serde(default = "d_60000")]
    pub max_delay_ms: u64,
    #[serde(default = "d_factor")]
    pub backoff_factor: f64,
    /// Extra random delay, as a fraction of the computed delay.
    #[serde(default = "d_jitter")]
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
            jitter: 0.25,
        }
    }
}

fn d_port() -> u16 {
    2333
}
fn d_password() -> String {
    "youshallnotpass".into()
}
fn d_1() -> u32 {
    1
}
fn d_1000() -> u64 {
    1_000
}
fn d_60000() -> u64 {
    60_000
}
fn d_factor() -> f64 {
    2.0
}
fn d_jitter() -> f64 {
    0.25
}
