//! Error types.
//!
//! Protocol paths never fail: transient send failures, presumed-dead peers,
//! stray replies and re-entrant requests are all absorbed and surfaced as
//! statistics. What remains is decoding (dropped by the receive path),
//! configuration, and cluster startup, which is the only fatal category.

use crate::ra::NodeId;

/// An inbound frame could not be turned into a protocol message.
#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("invalid json frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid binary frame: {0}")]
    Binary(#[from] bincode::Error),
    #[error("REQUEST from node {sender_id} carries no timestamp")]
    MissingTimestamp { sender_id: NodeId },
}

/// Cluster or protocol configuration is unusable.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("cluster has no members")]
    EmptyCluster,
    #[error("node id {0} is out of range (ids must be below 64)")]
    NodeIdOutOfRange(NodeId),
    #[error("node id {0} is listed more than once")]
    DuplicateNode(NodeId),
    #[error("address {address} is shared by nodes {first} and {second}")]
    DuplicateAddress {
        address: String,
        first: NodeId,
        second: NodeId,
    },
    #[error("node {0} is not a member of the cluster")]
    NotAMember(NodeId),
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("failure_rate {0} is outside [0.0, 1.0]")]
    FailureRate(f64),
    #[error("latency range is inverted: min {min_ms}ms > max {max_ms}ms")]
    LatencyRange { min_ms: u64, max_ms: u64 },
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// A cluster could not be brought up.
#[derive(thiserror::Error, Debug)]
pub enum ClusterError {
    #[error("endpoint for node {0} is already in use")]
    EndpointInUse(NodeId),
    #[error("node {0} is not part of the network")]
    UnknownNode(NodeId),
    #[error("failed to spawn thread for node {node_id}: {source}")]
    Spawn {
        node_id: NodeId,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
