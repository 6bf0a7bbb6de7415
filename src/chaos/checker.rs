//! History and Mutual Exclusion Checker.
//!
//! Records protocol events from every node in one global order and
//! verifies:
//! - Mutual Exclusion: no two nodes are in the critical section at once
//! - Ordering: a node never enters while a smaller outstanding request
//!   is still waiting
//! - Well-formedness: every exit matches an entry of the same node
//!
//! Overlaps between nodes where one had presumed the other dead are the
//! documented cost of the liveness relaxation. They are reported, but do
//! not fail the check.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;

use crate::ra::node::RequestStamp;
use crate::ra::NodeId;

/// A protocol event observed on one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProtocolEvent {
    /// The node broadcast a REQUEST.
    Requested { request: RequestStamp },
    /// The node entered the critical section.
    Entered { request: RequestStamp },
    /// The node left the critical section.
    Exited { node_id: NodeId },
    /// The node gave up on a request after its timeout.
    Cancelled { request: RequestStamp },
    /// `node_id` stopped waiting for `peer`.
    PeerPresumedDead { node_id: NodeId, peer: NodeId },
}

impl ProtocolEvent {
    pub fn node_id(&self) -> NodeId {
        match self {
            ProtocolEvent::Requested { request }
            | ProtocolEvent::Entered { request }
            | ProtocolEvent::Cancelled { request } => request.node_id,
            ProtocolEvent::Exited { node_id } | ProtocolEvent::PeerPresumedDead { node_id, .. } => {
                *node_id
            }
        }
    }
}

/// A single entry in the event history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// When the event was recorded.
    pub at: Instant,
    pub event: ProtocolEvent,
}

/// Global event log for all nodes.
#[derive(Debug, Default, Clone)]
pub struct History {
    entries: Vec<HistoryEntry>,
}

impl History {
    pub fn new() -> Self {
        History { entries: Vec::new() }
    }

    /// Record an event.
    pub fn record(&mut self, event: ProtocolEvent) {
        self.entries.push(HistoryEntry {
            at: Instant::now(),
            event,
        });
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    /// Events recorded by one node, in order.
    pub fn events_of(&self, node_id: NodeId) -> impl Iterator<Item = &ProtocolEvent> + '_ {
        self.entries
            .iter()
            .map(|e| &e.event)
            .filter(move |e| e.node_id() == node_id)
    }

    /// Node ids in the order they entered the critical section.
    pub fn entry_order(&self) -> Vec<NodeId> {
        self.entries
            .iter()
            .filter_map(|e| match e.event {
                ProtocolEvent::Entered { request } => Some(request.node_id),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Thread-safe history shared by every node runner of a cluster.
///
/// The mutex serializes recording, so the history order is a real-time
/// order: an `Exited` recorded before the deferred REPLYs go out always
/// precedes the next node's `Entered`.
#[derive(Debug, Clone, Default)]
pub struct SharedHistory {
    inner: Arc<Mutex<History>>,
}

impl SharedHistory {
    pub fn new() -> Self {
        SharedHistory::default()
    }

    pub fn record(&self, event: ProtocolEvent) {
        let mut history = self.inner.lock().unwrap();
        history.record(event);
    }

    /// Get a clone of the inner history for analysis.
    pub fn snapshot(&self) -> History {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

/// Result of a history check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// No violation other than tolerated overlaps.
    pub passed: bool,
    pub violations: Vec<Violation>,
    pub stats: CheckStats,
}

/// A property violation.
#[derive(Debug, Clone)]
pub struct Violation {
    pub kind: ViolationKind,
    pub description: String,
    /// Related history entries (by index).
    pub related_entries: Vec<usize>,
}

/// Types of violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    /// Two nodes in the critical section at once.
    MutualExclusion,
    /// Like `MutualExclusion`, but between nodes where one had presumed
    /// the other dead.
    PresumedDeadOverlap,
    /// A node entered ahead of a smaller outstanding request.
    OrderingViolation,
    /// A node entered twice without exiting, or exited without entering.
    Unbalanced,
}

impl ViolationKind {
    /// Whether this violation is an accepted consequence of presuming
    /// peers dead.
    pub fn is_tolerated(&self) -> bool {
        matches!(self, ViolationKind::PresumedDeadOverlap)
    }
}

/// Statistics from the check.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckStats {
    pub requests: usize,
    pub entries: usize,
    pub exits: usize,
    pub cancellations: usize,
    pub presumed_dead: usize,
    /// Nodes still in the critical section at the end of the history.
    pub still_inside: usize,
}

/// The history checker.
#[derive(Debug, Default)]
pub struct Checker;

impl Checker {
    pub fn new() -> Self {
        Checker
    }

    /// Verify mutual exclusion and request ordering over `history`.
    pub fn verify(&self, history: &History) -> CheckResult {
        let mut violations = Vec::new();
        let mut stats = CheckStats::default();

        // node -> history index of its current entry
        let mut inside: BTreeMap<NodeId, usize> = BTreeMap::new();
        // node -> outstanding request and the index it was recorded at
        let mut outstanding: BTreeMap<NodeId, (RequestStamp, usize)> = BTreeMap::new();
        // (observer, peer) pairs; order does not matter for tolerance
        let mut dead: HashSet<(NodeId, NodeId)> = HashSet::new();

        let suspects = |dead: &HashSet<(NodeId, NodeId)>, a: NodeId, b: NodeId| {
            dead.contains(&(a, b)) || dead.contains(&(b, a))
        };

        for (idx, entry) in history.entries().iter().enumerate() {
            match entry.event {
                ProtocolEvent::Requested { request } => {
                    stats.requests += 1;
                    outstanding.insert(request.node_id, (request, idx));
                }
                ProtocolEvent::Entered { request } => {
                    stats.entries += 1;
                    let node = request.node_id;

                    if let Some(&prev) = inside.get(&node) {
                        violations.push(Violation {
                            kind: ViolationKind::Unbalanced,
                            description: format!("node {} entered twice without exiting", node),
                            related_entries: vec![prev, idx],
                        });
                    }

                    for (&other, &other_idx) in inside.iter().filter(|(n, _)| **n != node) {
                        let kind = if suspects(&dead, node, other) {
                            ViolationKind::PresumedDeadOverlap
                        } else {
                            ViolationKind::MutualExclusion
                        };
                        violations.push(Violation {
                            kind,
                            description: format!(
                                "node {} entered while node {} was in the critical section",
                                node, other
                            ),
                            related_entries: vec![other_idx, idx],
                        });
                    }

                    for (&other, &(stamp, other_idx)) in outstanding.iter() {
                        if other == node || stamp >= request || suspects(&dead, node, other) {
                            continue;
                        }
                        violations.push(Violation {
                            kind: ViolationKind::OrderingViolation,
                            description: format!(
                                "node {} entered with ({}, {}) ahead of waiting request ({}, {})",
                                node, request.timestamp, node, stamp.timestamp, other
                            ),
                            related_entries: vec![other_idx, idx],
                        });
                    }

                    outstanding.remove(&node);
                    inside.insert(node, idx);
                }
                ProtocolEvent::Exited { node_id } => {
                    stats.exits += 1;
                    if inside.remove(&node_id).is_none() {
                        violations.push(Violation {
                            kind: ViolationKind::Unbalanced,
                            description: format!("node {} exited without entering", node_id),
                            related_entries: vec![idx],
                        });
                    }
                }
                ProtocolEvent::Cancelled { request } => {
                    stats.cancellations += 1;
                    outstanding.remove(&request.node_id);
                }
                ProtocolEvent::PeerPresumedDead { node_id, peer } => {
                    stats.presumed_dead += 1;
                    dead.insert((node_id, peer));
                }
            }
        }

        stats.still_inside = inside.len();

        CheckResult {
            passed: violations.iter().all(|v| v.kind.is_tolerated()),
            violations,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamp(timestamp: u64, node_id: NodeId) -> RequestStamp {
        RequestStamp::new(timestamp, node_id)
    }

    #[test]
    fn test_checker_sequential_entries_pass() {
        let mut history = History::new();
        history.record(ProtocolEvent::Requested { request: stamp(1, 1) });
        history.record(ProtocolEvent::Requested { request: stamp(2, 2) });
        history.record(ProtocolEvent::Entered { request: stamp(1, 1) });
        history.record(ProtocolEvent::Exited { node_id: 1 });
        history.record(ProtocolEvent::Entered { request: stamp(2, 2) });
        history.record(ProtocolEvent::Exited { node_id: 2 });

        let result = Checker::new().verify(&history);
        assert!(result.passed, "{:?}", result.violations);
        assert_eq!(result.stats.entries, 2);
        assert_eq!(result.stats.exits, 2);
        assert_eq!(history.entry_order(), vec![1, 2]);
    }

    #[test]
    fn test_checker_detects_overlap() {
        let mut history = History::new();
        history.record(ProtocolEvent::Entered { request: stamp(1, 1) });
        history.record(ProtocolEvent::Entered { request: stamp(1, 2) });

        let result = Checker::new().verify(&history);
        assert!(!result.passed);
        assert_eq!(result.violations[0].kind, ViolationKind::MutualExclusion);
        assert_eq!(result.stats.still_inside, 2);
    }

    #[test]
    fn test_checker_tolerates_presumed_dead_overlap() {
        let mut history = History::new();
        history.record(ProtocolEvent::PeerPresumedDead { node_id: 1, peer: 3 });
        history.record(ProtocolEvent::Entered { request: stamp(4, 3) });
        history.record(ProtocolEvent::Entered { request: stamp(5, 1) });

        let result = Checker::new().verify(&history);
        assert!(result.passed);
        assert_eq!(result.violations.len(), 1);
        assert_eq!(result.violations[0].kind, ViolationKind::PresumedDeadOverlap);
    }

    #[test]
    fn test_checker_detects_ordering_violation() {
        let mut history = History::new();
        history.record(ProtocolEvent::Requested { request: stamp(3, 1) });
        history.record(ProtocolEvent::Requested { request: stamp(3, 2) });
        history.record(ProtocolEvent::Entered { request: stamp(3, 2) });

        let result = Checker::new().verify(&history);
        assert!(!result.passed);
        assert_eq!(result.violations[0].kind, ViolationKind::OrderingViolation);
    }

    #[test]
    fn test_checker_cancelled_request_not_waiting() {
        let mut history = History::new();
        history.record(ProtocolEvent::Requested { request: stamp(1, 1) });
        history.record(ProtocolEvent::Requested { request: stamp(2, 2) });
        history.record(ProtocolEvent::Cancelled { request: stamp(1, 1) });
        history.record(ProtocolEvent::Entered { request: stamp(2, 2) });

        let result = Checker::new().verify(&history);
        assert!(result.passed, "{:?}", result.violations);
        assert_eq!(result.stats.cancellations, 1);
    }

    #[test]
    fn test_checker_unbalanced_exit() {
        let mut history = History::new();
        history.record(ProtocolEvent::Exited { node_id: 2 });

        let result = Checker::new().verify(&history);
        assert!(!result.passed);
        assert_eq!(result.violations[0].kind, ViolationKind::Unbalanced);
    }
}
