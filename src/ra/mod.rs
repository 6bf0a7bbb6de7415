//! Ricart-Agrawala distributed mutual exclusion.
//!
//! A node that wants the critical section stamps a REQUEST with its
//! Lamport clock and sends it to every live peer. It enters once every one
//! of them has sent a REPLY. A peer holds its REPLY back while it is in
//! the critical section, or while its own outstanding request comes first
//! in the `(timestamp, node_id)` order.
//!
//! # Invariants
//!
//! 1. **Mutual Exclusion**: at most one node is in the critical section,
//!    as long as no live, contending peer is presumed dead.
//! 2. **Total Order**: requests are ordered by `(timestamp, node_id)`;
//!    the smaller pair is never blocked by the larger one.
//! 3. **Serialized Inbound**: a node's state is mutated by one thread at a
//!    time; send workers only carry out [`Effect`]s.

pub mod clock;
pub mod message;
pub mod messenger;
pub mod network;
pub mod node;
pub mod pending;
pub mod stats;


/// Identity of a cluster member. Must be below [`MAX_CLUSTER_SIZE`].
pub type NodeId = u32;

/// Lamport clock value.
pub type Timestamp = u64;

pub use clock::LogicalClock;
pub use message::{Codec, Message, MessageKind, WireMessage};
pub use messenger::{Backoff, Endpoint, Messenger, RetryPolicy, SendReport, Transport};
pub use network::MockNetwork;
pub use node::{Effect, Node, NodeState, RequestStamp};
pub use pending::{DeferredQueue, DeferredRequest, NodeBitset, PendingReplies, MAX_CLUSTER_SIZE};
pub use stats::NodeStats;
