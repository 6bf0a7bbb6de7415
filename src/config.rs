//! Static cluster and protocol configuration.
//!
//! The cluster table (node id to transport address) is built once at
//! startup, validated, and then shared read-only by every node.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::chaos::network::ChaosConfig;
use crate::error::ConfigError;
use crate::ra::message::Codec;
use crate::ra::messenger::{Backoff, RetryPolicy};
use crate::ra::pending::MAX_CLUSTER_SIZE;
use crate::ra::NodeId;

const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Environment variable prefix for overrides, nested keys split on `__`.
pub const ENV_PREFIX: &str = "RAMUTEX_";

/// One entry of the cluster table as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: String,
}

#[derive(Deserialize)]
struct RawCluster {
    members: Vec<Member>,
}

/// Fixed membership: every node id and its transport address.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawCluster")]
pub struct ClusterConfig {
    members: BTreeMap<NodeId, String>,
}

impl TryFrom<RawCluster> for ClusterConfig {
    type Error = ConfigError;

    fn try_from(raw: RawCluster) -> Result<Self, Self::Error> {
        ClusterConfig::new(raw.members.into_iter().map(|m| (m.id, m.address)))
    }
}

impl ClusterConfig {
    /// Build and validate a cluster table.
    pub fn new<I, S>(members: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (NodeId, S)>,
        S: Into<String>,
    {
        let mut table: BTreeMap<NodeId, String> = BTreeMap::new();
        let mut by_address: BTreeMap<String, NodeId> = BTreeMap::new();

        for (id, address) in members {
            let address = address.into();
            if id >= MAX_CLUSTER_SIZE {
                return Err(ConfigError::NodeIdOutOfRange(id));
            }
            if table.contains_key(&id) {
                return Err(ConfigError::DuplicateNode(id));
            }
            if let Some(&first) = by_address.get(&address) {
                return Err(ConfigError::DuplicateAddress {
                    address,
                    first,
                    second: id,
                });
            }
            by_address.insert(address.clone(), id);
            table.insert(id, address);
        }

        if table.is_empty() {
            return Err(ConfigError::EmptyCluster);
        }

        Ok(ClusterConfig { members: table })
    }

    /// In-process cluster; addresses are `local:<id>`.
    pub fn local<I: IntoIterator<Item = NodeId>>(ids: I) -> Result<Self, ConfigError> {
        ClusterConfig::new(ids.into_iter().map(|id| (id, format!("local:{}", id))))
    }

    pub fn contains(&self, node_id: NodeId) -> bool {
        self.members.contains_key(&node_id)
    }

    pub fn address(&self, node_id: NodeId) -> Option<&str> {
        self.members.get(&node_id).map(String::as_str)
    }

    /// All member ids, ascending.
    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.keys().copied()
    }

    /// Every member except `node_id`.
    pub fn peers_of(&self, node_id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node_ids().filter(move |&id| id != node_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Per-node protocol tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Attempts per message, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay_ms: u64,
    pub backoff: Backoff,
    /// Give up on a request after this long. `None` waits forever.
    pub request_timeout_ms: Option<u64>,
    /// Threads delivering outbound messages for one node.
    pub dispatch_workers: usize,
    pub codec: Codec,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            max_attempts: 3,
            retry_delay_ms: 1000,
            backoff: Backoff::Fixed,
            request_timeout_ms: None,
            dispatch_workers: 4,
            codec: Codec::Json,
        }
    }
}

impl ProtocolConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.backoff,
        }
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        Ok(())
    }
}

/// Injected network behaviour for simulations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChaosSettings {
    /// Probability that a single send attempt fails.
    pub failure_rate: f64,
    pub min_latency_ms: u64,
    pub max_latency_ms: u64,
}

impl Default for ChaosSettings {
    fn default() -> Self {
        ChaosSettings {
            failure_rate: 0.0,
            min_latency_ms: 0,
            max_latency_ms: 0,
        }
    }
}

impl ChaosSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.failure_rate) {
            return Err(ConfigError::FailureRate(self.failure_rate));
        }
        if self.min_latency_ms > self.max_latency_ms {
            return Err(ConfigError::LatencyRange {
                min_ms: self.min_latency_ms,
                max_ms: self.max_latency_ms,
            });
        }
        Ok(())
    }

    pub fn to_chaos_config(&self) -> ChaosConfig {
        ChaosConfig {
            failure_rate: self.failure_rate,
            latency_range: (
                Duration::from_millis(self.min_latency_ms),
                Duration::from_millis(self.max_latency_ms),
            ),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// `EnvFilter` directive, e.g. `info` or `ramutex=debug`.
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        ObservabilityConfig {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

/// Everything a driver needs to bring up a cluster.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub protocol: ProtocolConfig,
    #[serde(default)]
    pub chaos: ChaosSettings,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Settings {
    /// Load the built-in defaults, then `path` if given, then
    /// `RAMUTEX_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::string(DEFAULT_CONFIG));

        if let Some(path) = path {
            figment = figment.merge(Toml::file_exact(path));
        }

        let settings: Settings = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::Load(Box::new(e)))?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol.validate()?;
        self.chaos.validate()
    }
}
