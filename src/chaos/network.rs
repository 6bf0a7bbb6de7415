//! Chaos Network Interceptor.
//!
//! Wraps MockNetwork to inject network faults:
//! - Send failure (failure_rate), reported to the sender
//! - Latency injection (latency_range), paid by the sending thread
//! - Network partitions (partition_map)
//! - Killed nodes, which can neither send nor be reached

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::ClusterError;
use crate::ra::messenger::{Endpoint, Transport};
use crate::ra::network::MockNetwork;
use crate::ra::NodeId;

/// Configuration for chaos network behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct ChaosConfig {
    /// Probability that a send attempt fails (0.0 - 1.0).
    pub failure_rate: f64,
    /// Range of latency to inject per send.
    pub latency_range: (Duration, Duration),
    /// Whether chaos effects are enabled.
    pub enabled: bool,
}

impl Default for ChaosConfig {
    fn default() -> Self {
        ChaosConfig {
            failure_rate: 0.0,
            latency_range: (Duration::ZERO, Duration::ZERO),
            enabled: true,
        }
    }
}

/// Per-node send counters kept by the network.
#[derive(Debug, Default)]
struct LinkStats {
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// State shared between the network and every chaos sender.
struct ChaosShared {
    config: RwLock<ChaosConfig>,
    /// Set of (from, to) pairs that cannot communicate.
    partition_map: RwLock<HashSet<(NodeId, NodeId)>>,
    kill_flags: HashMap<NodeId, AtomicBool>,
    stats: HashMap<NodeId, LinkStats>,
}

impl ChaosShared {
    fn is_killed(&self, node_id: NodeId) -> bool {
        self.kill_flags
            .get(&node_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    fn is_partitioned(&self, from: NodeId, to: NodeId) -> bool {
        self.partition_map
            .read()
            .map(|p| p.contains(&(from, to)))
            .unwrap_or(false)
    }

    fn config(&self) -> ChaosConfig {
        self.config
            .read()
            .map(|c| c.clone())
            .unwrap_or_default()
    }
}

/// Sending half of a node's connection with chaos applied.
struct ChaosSender {
    node_id: NodeId,
    inner: Arc<dyn Transport>,
    shared: Arc<ChaosShared>,
}

impl ChaosSender {
    fn dropped(&self) -> bool {
        if let Some(stats) = self.shared.stats.get(&self.node_id) {
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        false
    }
}

impl Transport for ChaosSender {
    fn send_frame(&self, target: NodeId, frame: Vec<u8>) -> bool {
        if self.shared.is_killed(self.node_id) || self.shared.is_killed(target) {
            return self.dropped();
        }

        let cfg = self.shared.config();

        if cfg.enabled {
            // Apply latency
            let (min_latency, max_latency) = cfg.latency_range;
            if max_latency > Duration::ZERO {
                let latency = if min_latency >= max_latency {
                    max_latency
                } else {
                    let min_ms = min_latency.as_millis() as u64;
                    let max_ms = max_latency.as_millis() as u64;
                    Duration::from_millis(rand::thread_rng().gen_range(min_ms..=max_ms))
                };
                if latency > Duration::ZERO {
                    thread::sleep(latency);
                }
            }

            if self.shared.is_partitioned(self.node_id, target) {
                return self.dropped();
            }

            // Apply failure rate
            if cfg.failure_rate > 0.0 && rand::thread_rng().gen::<f64>() < cfg.failure_rate {
                return self.dropped();
            }
        }

        if self.inner.send_frame(target, frame) {
            if let Some(stats) = self.shared.stats.get(&self.node_id) {
                stats.sent.fetch_add(1, Ordering::Relaxed);
            }
            true
        } else {
            self.dropped()
        }
    }
}

/// Chaos-enabled mock network.
pub struct ChaosNetwork {
    inner: MockNetwork,
    shared: Arc<ChaosShared>,
}

impl ChaosNetwork {
    /// Create a chaos network for the given node ids.
    pub fn new<I: IntoIterator<Item = NodeId>>(node_ids: I, config: ChaosConfig) -> Self {
        let inner = MockNetwork::new(node_ids);

        let kill_flags = inner
            .node_ids()
            .iter()
            .map(|&id| (id, AtomicBool::new(false)))
            .collect();
        let stats = inner
            .node_ids()
            .iter()
            .map(|&id| (id, LinkStats::default()))
            .collect();

        ChaosNetwork {
            inner,
            shared: Arc::new(ChaosShared {
                config: RwLock::new(config),
                partition_map: RwLock::new(HashSet::new()),
                kill_flags,
                stats,
            }),
        }
    }

    /// Create a chaos-enabled endpoint for a node.
    pub fn create_endpoint(&self, node_id: NodeId) -> Result<Endpoint, ClusterError> {
        let endpoint = self.inner.create_endpoint(node_id)?;

        Ok(Endpoint {
            node_id,
            transport: Arc::new(ChaosSender {
                node_id,
                inner: endpoint.transport,
                shared: self.shared.clone(),
            }),
            inbox: endpoint.inbox,
        })
    }

    /// Kill a node: every send from or to it fails until revived.
    pub fn kill_node(&self, node_id: NodeId) {
        if let Some(flag) = self.shared.kill_flags.get(&node_id) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    /// Revive a killed node.
    pub fn revive_node(&self, node_id: NodeId) {
        if let Some(flag) = self.shared.kill_flags.get(&node_id) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    /// Check if a node is killed.
    pub fn is_killed(&self, node_id: NodeId) -> bool {
        self.shared.is_killed(node_id)
    }

    /// Add a network partition between two nodes.
    pub fn partition(&self, from: NodeId, to: NodeId) {
        if let Ok(mut partitions) = self.shared.partition_map.write() {
            partitions.insert((from, to));
            partitions.insert((to, from)); // Bidirectional
        }
    }

    /// Remove a network partition between two nodes.
    pub fn heal_partition(&self, from: NodeId, to: NodeId) {
        if let Ok(mut partitions) = self.shared.partition_map.write() {
            partitions.remove(&(from, to));
            partitions.remove(&(to, from));
        }
    }

    /// Update chaos configuration.
    pub fn set_config(&self, new_config: ChaosConfig) {
        if let Ok(mut config) = self.shared.config.write() {
            *config = new_config;
        }
    }

    /// Get current chaos configuration.
    pub fn get_config(&self) -> ChaosConfig {
        self.shared.config()
    }

    /// Frames delivered and dropped on sends from `node_id`.
    pub fn link_stats(&self, node_id: NodeId) -> (u64, u64) {
        self.shared
            .stats
            .get(&node_id)
            .map(|s| (s.sent.load(Ordering::Relaxed), s.dropped.load(Ordering::Relaxed)))
            .unwrap_or((0, 0))
    }

    pub fn node_ids(&self) -> &[NodeId] {
        self.inner.node_ids()
    }
}
