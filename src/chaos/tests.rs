//! Chaos Integration Tests.
//!
//! Threaded clusters under injected send failures, dead peers and
//! timeouts, verified against the recorded history.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::chaos::checker::{ProtocolEvent, ViolationKind};
use crate::chaos::network::ChaosConfig;
use crate::chaos::runner::{ClusterManager, CriticalWork, SleepWork};
use crate::config::{ClusterConfig, ProtocolConfig};
use crate::ra::message::Codec;
use crate::ra::node::NodeState;
use crate::ra::NodeId;

const WAIT: Duration = Duration::from_secs(10);

fn fast_protocol() -> ProtocolConfig {
    ProtocolConfig {
        max_attempts: 3,
        retry_delay_ms: 5,
        ..ProtocolConfig::default()
    }
}

fn start_cluster(size: u32, protocol: ProtocolConfig, chaos: ChaosConfig) -> ClusterManager {
    let cluster = ClusterConfig::local(1..=size).unwrap();
    let work: Arc<dyn CriticalWork> = Arc::new(SleepWork(Duration::from_millis(20)));
    ClusterManager::start(cluster, &protocol, chaos, work).unwrap()
}

/// Test: test_single_node_cluster
///
/// Verifies:
/// 1. A node without peers enters at once
/// 2. It returns to IDLE after the critical work
#[test]
fn test_single_node_cluster() {
    let cluster = start_cluster(1, fast_protocol(), ChaosConfig::default());

    assert!(cluster.request_critical_section(1));
    assert!(cluster.wait_for_entries(1, WAIT));
    assert!(cluster.wait_until_idle(WAIT));

    let stats = cluster.node(1).unwrap().get_statistics().unwrap();
    assert_eq!(stats.cs_entries, 1);
    assert_eq!(stats.messages_sent, 0);
}

/// Test: test_concurrent_requests
///
/// Verifies:
/// 1. Three simultaneous requests all complete
/// 2. Nobody overlaps in the critical section
/// 3. Every node answered deferred requests on exit
#[test]
fn test_concurrent_requests() {
    let cluster = start_cluster(3, fast_protocol(), ChaosConfig::default());

    for node_id in 1..=3 {
        assert!(cluster.request_critical_section(node_id));
    }

    assert!(cluster.wait_for_entries(3, WAIT));
    assert!(cluster.wait_until_idle(WAIT));

    let result = cluster.verify();
    assert!(result.passed, "violations: {:?}", result.violations);
    assert!(result.violations.is_empty());
    assert_eq!(result.stats.entries, 3);
    assert_eq!(result.stats.exits, 3);

    for (node_id, stats) in cluster.all_statistics() {
        assert_eq!(stats.cs_entries, 1, "node {}", node_id);
        assert_eq!(stats.messages_failed, 0);
        assert_eq!(stats.peers_presumed_dead, 0);
    }

    for node in cluster.nodes() {
        let status = node.status().unwrap();
        assert_eq!(status.deferred, 0);
        assert_eq!(status.pending, 0);
        assert_eq!(status.request_timestamp, None);
    }
}

/// Test: test_sequential_requests
///
/// Verifies:
/// 1. Requests issued one after another enter in issue order
/// 2. No replies are deferred when nobody contends
#[test]
fn test_sequential_requests() {
    let cluster = start_cluster(3, fast_protocol(), ChaosConfig::default());

    for (round, node_id) in [2, 3, 1].into_iter().enumerate() {
        assert!(cluster.request_critical_section(node_id));
        assert!(cluster.wait_for_entries(round + 1, WAIT));
        assert!(cluster.wait_until_idle(WAIT));
    }

    let history = cluster.history().snapshot();
    assert_eq!(history.entry_order(), vec![2, 3, 1]);

    let deferred: u64 = cluster
        .all_statistics()
        .iter()
        .map(|(_, s)| s.replies_deferred)
        .sum();
    assert_eq!(deferred, 0);
    assert!(cluster.verify().passed);
}

/// Test: test_high_contention
///
/// Verifies:
/// 1. Repeated rounds of everyone requesting at once stay exclusive
/// 2. Every round grants every node exactly once
/// 3. The binary codec drives the same protocol
#[test]
fn test_high_contention() {
    let protocol = ProtocolConfig {
        codec: Codec::Binary,
        ..fast_protocol()
    };
    let cluster = start_cluster(4, protocol, ChaosConfig::default());

    const ROUNDS: usize = 5;
    for round in 0..ROUNDS {
        for node_id in 1..=4 {
            assert!(cluster.request_critical_section(node_id));
        }
        assert!(cluster.wait_for_entries(4 * (round + 1), WAIT));
        assert!(cluster.wait_until_idle(WAIT));
    }

    let result = cluster.verify();
    assert!(result.passed, "violations: {:?}", result.violations);
    assert_eq!(result.stats.entries, 4 * ROUNDS);

    for (_, stats) in cluster.all_statistics() {
        assert_eq!(stats.cs_entries, ROUNDS as u64);
        assert_eq!(stats.requests_issued, ROUNDS as u64);
    }
}

/// Test: test_critical_work_is_exclusive
///
/// Verifies:
/// 1. The supplied work runs once per entry
/// 2. No two invocations of the work ever run at the same time
#[test]
fn test_critical_work_is_exclusive() {
    let active = Arc::new(AtomicUsize::new(0));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let runs = Arc::new(AtomicUsize::new(0));

    let work = {
        let (active, overlaps, runs) = (active.clone(), overlaps.clone(), runs.clone());
        move |_node_id: NodeId| {
            if active.fetch_add(1, Ordering::SeqCst) > 0 {
                overlaps.fetch_add(1, Ordering::SeqCst);
            }
            runs.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(5));
            active.fetch_sub(1, Ordering::SeqCst);
        }
    };

    let cluster = ClusterManager::start(
        ClusterConfig::local(1..=3).unwrap(),
        &fast_protocol(),
        ChaosConfig::default(),
        Arc::new(work),
    )
    .unwrap();

    for round in 0..3 {
        for node_id in 1..=3 {
            cluster.request_critical_section(node_id);
        }
        assert!(cluster.wait_for_entries(3 * (round + 1), WAIT));
        assert!(cluster.wait_until_idle(WAIT));
    }

    assert_eq!(runs.load(Ordering::SeqCst), 9);
    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}

/// Test: test_dead_peer_excluded
///
/// Verifies:
/// 1. Sends to a killed node exhaust their retries
/// 2. The requester presumes it dead and enters with the live subset
/// 3. Later requests are no longer sent to it
#[test]
fn test_dead_peer_excluded() {
    let mut cluster = start_cluster(3, fast_protocol(), ChaosConfig::default());

    assert!(cluster.kill_node(3));
    assert!(!cluster.kill_node(3));

    assert!(cluster.request_critical_section(1));
    assert!(cluster.wait_for_entries(1, WAIT));
    assert!(cluster.wait_until_idle(WAIT));

    let node1 = cluster.node(1).unwrap();
    let stats = node1.get_statistics().unwrap();
    assert_eq!(stats.cs_entries, 1);
    assert_eq!(stats.peers_presumed_dead, 1);
    assert_eq!(stats.messages_failed, 3);
    assert_eq!(stats.messages_retried, 2);
    assert_eq!(node1.status().unwrap().failed_peers, vec![3]);

    // Second request: one REQUEST to node 2, no more attempts at node 3
    let sent_before = stats.messages_sent;
    assert!(cluster.request_critical_section(1));
    assert!(cluster.wait_for_entries(2, WAIT));
    assert!(cluster.wait_until_idle(WAIT));

    let stats = cluster.node(1).unwrap().get_statistics().unwrap();
    assert_eq!(stats.cs_entries, 2);
    assert_eq!(stats.messages_sent, sent_before + 1);
    assert_eq!(stats.messages_failed, 3);

    let history = cluster.history().snapshot();
    assert!(history
        .events_of(1)
        .any(|e| *e == ProtocolEvent::PeerPresumedDead { node_id: 1, peer: 3 }));
    assert!(cluster.verify().passed);
}

/// Test: test_request_timeout_cancels
///
/// Verifies:
/// 1. A request that cannot collect every reply is cancelled on timeout
/// 2. The node returns to IDLE instead of hanging
/// 3. The cancellation is counted and recorded
/// 4. Once the partition heals, the next request enters
#[test]
fn test_request_timeout_cancels() {
    let protocol = ProtocolConfig {
        max_attempts: 3,
        retry_delay_ms: 500,
        request_timeout_ms: Some(300),
        ..ProtocolConfig::default()
    };
    let cluster = start_cluster(2, protocol, ChaosConfig::default());
    cluster.network().partition(1, 2);

    assert!(cluster.request_critical_section(1));
    assert_eq!(cluster.node(1).unwrap().state(), Some(NodeState::Requesting));
    assert!(cluster.wait_until_idle(WAIT));

    let stats = cluster.node(1).unwrap().get_statistics().unwrap();
    assert_eq!(stats.requests_cancelled, 1);
    assert_eq!(stats.cs_entries, 0);

    let history = cluster.history().snapshot();
    assert!(history
        .events_of(1)
        .any(|e| matches!(e, ProtocolEvent::Cancelled { .. })));
    assert!(history.entry_order().is_empty());

    // A late grant for the cancelled request must not count toward this one
    cluster.network().heal_partition(1, 2);
    assert!(cluster.request_critical_section(1));
    assert!(cluster.wait_for_entries(1, WAIT));
    assert!(cluster.wait_until_idle(WAIT));

    let stats = cluster.node(1).unwrap().get_statistics().unwrap();
    assert_eq!(stats.cs_entries, 1);
    assert_eq!(stats.requests_cancelled, 1);
    assert!(cluster.verify().passed);
}

/// Test: test_lossy_network
///
/// Verifies:
/// 1. Under a 30% send failure rate every request ends (entered or
///    cancelled)
/// 2. Retries are counted
/// 3. The history has no overlap other than between nodes that
///    presumed each other dead
#[test]
fn test_lossy_network() {
    let protocol = ProtocolConfig {
        max_attempts: 5,
        retry_delay_ms: 2,
        request_timeout_ms: Some(2_000),
        ..ProtocolConfig::default()
    };
    let chaos = ChaosConfig {
        failure_rate: 0.3,
        latency_range: (Duration::from_millis(0), Duration::from_millis(3)),
        ..ChaosConfig::default()
    };
    let cluster = start_cluster(3, protocol, chaos);

    for _ in 0..4 {
        for node_id in 1..=3 {
            cluster.request_critical_section(node_id);
        }
        assert!(cluster.wait_until_idle(WAIT));
    }

    let result = cluster.verify();
    assert!(result.passed, "violations: {:?}", result.violations);
    assert!(result
        .violations
        .iter()
        .all(|v| v.kind == ViolationKind::PresumedDeadOverlap));
    assert_eq!(result.stats.requests, result.stats.entries + result.stats.cancellations);
    assert_eq!(result.stats.still_inside, 0);

    let retried: u64 = cluster
        .all_statistics()
        .iter()
        .map(|(_, s)| s.messages_retried)
        .sum();
    assert!(retried > 0);
}
