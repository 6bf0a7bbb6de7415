//! Fault injection and verification for in-process clusters.

pub mod checker;
pub mod network;
pub mod runner;

#[cfg(test)]
mod tests;

pub use checker::{
    CheckResult, CheckStats, Checker, History, HistoryEntry, ProtocolEvent, SharedHistory,
    Violation, ViolationKind,
};
pub use network::{ChaosConfig, ChaosNetwork};
pub use runner::{
    spawn_node, ClusterManager, CriticalWork, NodeCommand, NodeConfig, NodeHandle, NodeStatus,
    SleepWork,
};
