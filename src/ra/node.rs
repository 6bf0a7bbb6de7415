//! Ricart-Agrawala protocol engine.
//!
//! `Node` owns the clock, request state, pending replies and deferred
//! queue of one cluster member. It performs no I/O: every entry point
//! returns the [`Effect`]s the caller must carry out, in order. The
//! runner feeds it from a single serialized inbound channel, which is
//! what makes the deferral rule and the pending-reply bookkeeping safe
//! without locks.
//!
//! # Invariants
//!
//! 1. **Monotonic Clock**: the Lamport clock never decreases.
//! 2. **Single Request**: at most one outstanding request per node; a
//!    second `request_critical_section` while not IDLE is a no-op.
//! 3. **Priority**: a REQUEST is deferred iff this node is in the critical
//!    section, or is requesting with a smaller `(timestamp, node_id)`.
//! 4. **Full Drain**: leaving the critical section (or abandoning a
//!    request) answers every deferred peer exactly once.

use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::ClusterConfig;
use crate::error::ConfigError;

use super::clock::LogicalClock;
use super::message::Message;
use super::messenger::SendReport;
use super::pending::{DeferredQueue, NodeBitset, PendingReplies};
use super::stats::NodeStats;
use super::{NodeId, Timestamp};

/// Protocol state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Not interested in the critical section.
    Idle,
    /// Waiting for permission from every live peer.
    Requesting,
    /// Holding the critical section.
    InCriticalSection,
}

/// Position of a request in the cluster-wide total order.
///
/// Ordered by timestamp, ties broken by the smaller node id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RequestStamp {
    pub timestamp: Timestamp,
    pub node_id: NodeId,
}

impl RequestStamp {
    pub fn new(timestamp: Timestamp, node_id: NodeId) -> Self {
        RequestStamp { timestamp, node_id }
    }
}

/// Something the caller has to do on the node's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Deliver a message to a peer (with retries).
    Send { to: NodeId, message: Message },
    /// The node now holds the critical section.
    Entered { request: RequestStamp },
    /// The node left the critical section.
    Exited,
    /// The pending request was abandoned.
    Cancelled { request: RequestStamp },
}

/// Per-node protocol state machine.
pub struct Node {
    node_id: NodeId,
    /// Every other cluster member.
    peers: NodeBitset,
    /// Peers presumed dead after exhausting retries.
    failed: NodeBitset,
    clock: LogicalClock,
    state: NodeState,
    /// Timestamp of the outstanding request (REQUESTING / IN_CS only).
    request_timestamp: Option<Timestamp>,
    pending: PendingReplies,
    deferred: DeferredQueue,
    stats: NodeStats,
}

impl Node {
    /// Create a node for `node_id`, idle with its clock at zero.
    pub fn new(node_id: NodeId, cluster: &ClusterConfig) -> Result<Self, ConfigError> {
        if !cluster.contains(node_id) {
            return Err(ConfigError::NotAMember(node_id));
        }

        Ok(Node {
            node_id,
            peers: cluster.peers_of(node_id).collect(),
            failed: NodeBitset::new(),
            clock: LogicalClock::new(),
            state: NodeState::Idle,
            request_timestamp: None,
            pending: PendingReplies::new(),
            deferred: DeferredQueue::new(),
            stats: NodeStats::default(),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Current Lamport clock value.
    pub fn clock(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn request_timestamp(&self) -> Option<Timestamp> {
        self.request_timestamp
    }

    /// Stamp of the outstanding request, if any.
    pub fn current_request(&self) -> Option<RequestStamp> {
        self.request_timestamp
            .map(|ts| RequestStamp::new(ts, self.node_id))
    }

    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn peers(&self) -> NodeBitset {
        self.peers
    }

    pub fn failed_peers(&self) -> NodeBitset {
        self.failed
    }

    /// Peers whose permission a new request will wait for.
    pub fn live_peers(&self) -> NodeBitset {
        self.peers.iter().filter(|p| !self.failed.contains(*p)).collect()
    }

    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// Ask for the critical section.
    ///
    /// Broadcasts REQUEST to every live peer and returns immediately;
    /// entry happens later, when the last REPLY is handled. Calling this
    /// while already requesting or inside the critical section does nothing.
    pub fn request_critical_section(&mut self) -> Vec<Effect> {
        if self.state != NodeState::Idle {
            debug!(node_id = self.node_id, state = ?self.state, "request ignored, not idle");
            return Vec::new();
        }

        let timestamp = self.clock.tick();
        let live = self.live_peers();

        self.request_timestamp = Some(timestamp);
        self.state = NodeState::Requesting;
        self.pending.expect(live);
        self.stats.requests_issued += 1;

        info!(
            node_id = self.node_id,
            timestamp,
            peers = ?live,
            skipped = ?self.failed,
            "requesting critical section"
        );

        let message = Message::Request {
            sender_id: self.node_id,
            timestamp,
        };
        let mut effects: Vec<Effect> = live
            .iter()
            .map(|to| Effect::Send { to, message })
            .collect();

        // Nobody left to ask.
        if self.pending.is_complete() {
            effects.push(self.enter());
        }

        effects
    }

    /// Handle one decoded inbound message.
    pub fn handle_message(&mut self, message: Message) -> Vec<Effect> {
        let sender = message.sender();
        if sender == self.node_id {
            warn!(node_id = self.node_id, "ignoring message from self");
            return Vec::new();
        }
        if !self.peers.contains(sender) {
            warn!(node_id = self.node_id, sender, "ignoring message from non-member");
            return Vec::new();
        }

        self.clock.observe(message.timestamp().unwrap_or(0));

        match message {
            Message::Request { sender_id, timestamp } => self.handle_request(sender_id, timestamp),
            Message::Reply { sender_id, timestamp } => self.handle_reply(sender_id, timestamp),
        }
    }

    fn handle_request(&mut self, sender: NodeId, timestamp: Timestamp) -> Vec<Effect> {
        let theirs = RequestStamp::new(timestamp, sender);

        let defer = match self.state {
            NodeState::InCriticalSection => true,
            NodeState::Requesting => self.current_request().is_some_and(|ours| ours < theirs),
            NodeState::Idle => false,
        };

        if defer {
            if self.deferred.defer(sender, timestamp) {
                self.stats.replies_deferred += 1;
            }
            debug!(
                node_id = self.node_id,
                peer = sender,
                timestamp,
                state = ?self.state,
                "deferring reply"
            );
            return Vec::new();
        }

        trace!(node_id = self.node_id, peer = sender, timestamp, "granting request");
        vec![Effect::Send {
            to: sender,
            message: Message::Reply {
                sender_id: self.node_id,
                timestamp: Some(timestamp),
            },
        }]
    }

    fn handle_reply(&mut self, sender: NodeId, stamp: Option<Timestamp>) -> Vec<Effect> {
        if self.state != NodeState::Requesting {
            self.stray_reply(sender, "not requesting");
            return Vec::new();
        }

        // A grant carries a timestamp at or above the request it answers,
        // whether the peer echoes our request or sends its own clock.
        // Anything lower answers an earlier, cancelled request.
        if stamp.is_some_and(|ts| self.request_timestamp.is_some_and(|current| ts < current)) {
            self.stray_reply(sender, "stale timestamp");
            return Vec::new();
        }

        if !self.pending.grant(sender) {
            self.stray_reply(sender, "not pending");
            return Vec::new();
        }

        trace!(
            node_id = self.node_id,
            peer = sender,
            remaining = self.pending.len(),
            "reply received"
        );

        if self.pending.is_complete() {
            vec![self.enter()]
        } else {
            Vec::new()
        }
    }

    fn stray_reply(&mut self, sender: NodeId, reason: &'static str) {
        self.stats.stray_replies += 1;
        trace!(node_id = self.node_id, peer = sender, reason, "ignoring reply");
    }

    fn enter(&mut self) -> Effect {
        self.state = NodeState::InCriticalSection;
        self.pending.clear();
        self.stats.cs_entries += 1;

        let request = RequestStamp::new(self.request_timestamp.unwrap_or(0), self.node_id);
        info!(
            node_id = self.node_id,
            timestamp = request.timestamp,
            "entering critical section"
        );
        Effect::Entered { request }
    }

    /// Leave the critical section once the critical work has finished.
    ///
    /// Every deferred peer gets its REPLY before the node is idle again.
    /// Does nothing unless the node is in the critical section.
    pub fn exit_critical_section(&mut self) -> Vec<Effect> {
        if self.state != NodeState::InCriticalSection {
            debug!(node_id = self.node_id, state = ?self.state, "exit ignored, not in critical section");
            return Vec::new();
        }

        let mut effects = self.drain_deferred();
        self.state = NodeState::Idle;
        self.request_timestamp = None;

        info!(node_id = self.node_id, released = effects.len(), "exiting critical section");
        effects.push(Effect::Exited);
        effects
    }

    /// The request timeout fired.
    ///
    /// Enters if every live peer has replied, otherwise abandons the
    /// request and answers everyone it was holding back.
    pub fn on_request_timeout(&mut self) -> Vec<Effect> {
        if self.state != NodeState::Requesting {
            return Vec::new();
        }
        if self.pending.is_complete() {
            return vec![self.enter()];
        }

        let request = RequestStamp::new(self.request_timestamp.unwrap_or(0), self.node_id);
        warn!(
            node_id = self.node_id,
            timestamp = request.timestamp,
            missing = ?self.pending.peers(),
            "request timed out, cancelling"
        );

        self.pending.clear();
        let mut effects = self.drain_deferred();
        self.state = NodeState::Idle;
        self.request_timestamp = None;
        self.stats.requests_cancelled += 1;

        effects.push(Effect::Cancelled { request });
        effects
    }

    fn drain_deferred(&mut self) -> Vec<Effect> {
        self.deferred
            .drain()
            .into_iter()
            .map(|d| Effect::Send {
                to: d.peer,
                message: Message::Reply {
                    sender_id: self.node_id,
                    timestamp: Some(d.timestamp),
                },
            })
            .collect()
    }

    /// Account for a finished send and react to an undeliverable peer.
    pub fn on_send_report(&mut self, report: &SendReport) -> Vec<Effect> {
        let attempts = u64::from(report.attempts);
        if report.delivered {
            self.stats.messages_sent += 1;
            self.stats.messages_failed += attempts.saturating_sub(1);
        } else {
            self.stats.messages_failed += attempts;
        }
        self.stats.messages_retried += attempts.saturating_sub(1);

        if report.delivered {
            Vec::new()
        } else {
            self.mark_unreachable(report.peer)
        }
    }

    /// Presume a peer dead for the rest of the run.
    ///
    /// Future requests no longer wait for it, and neither does the
    /// current one. If that peer is in fact alive and contending, two
    /// nodes can hold the critical section at once.
    pub fn mark_unreachable(&mut self, peer: NodeId) -> Vec<Effect> {
        if !self.peers.contains(peer) || self.failed.contains(peer) {
            return Vec::new();
        }

        self.failed.insert(peer);
        self.stats.peers_presumed_dead += 1;
        warn!(node_id = self.node_id, peer, "peer presumed dead");

        if self.state == NodeState::Requesting
            && self.pending.forget(peer)
            && self.pending.is_complete()
        {
            return vec![self.enter()];
        }
        Vec::new()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.node_id)
            .field("state", &self.state)
            .field("clock", &self.clock.now())
            .field("request_timestamp", &self.request_timestamp)
            .field("pending", &self.pending.peers())
            .field("deferred", &self.deferred.len())
            .field("failed", &self.failed)
            .finish()
    }
}
