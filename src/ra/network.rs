//! Mock Network for protocol testing.
//!
//! Uses crossbeam channels to carry frames between nodes of one process.
//! Delivery is immediate and lossless; faults are layered on top by
//! `ChaosNetwork`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::error::ClusterError;

use super::messenger::{Endpoint, Transport};
use super::NodeId;

/// Sending half of a node's connection to a [`MockNetwork`].
pub struct MockSender {
    /// This node's ID.
    node_id: NodeId,
    /// Inboxes of the other nodes.
    tx_map: HashMap<NodeId, Sender<Vec<u8>>>,
}

impl Transport for MockSender {
    fn send_frame(&self, target: NodeId, frame: Vec<u8>) -> bool {
        if target == self.node_id {
            return false;
        }

        match self.tx_map.get(&target) {
            Some(tx) => tx.send(frame).is_ok(),
            None => false,
        }
    }
}

/// Mock network that connects a fixed set of nodes via channels.
pub struct MockNetwork {
    node_ids: Vec<NodeId>,
    /// Senders for each node's inbox.
    node_senders: HashMap<NodeId, Sender<Vec<u8>>>,
    /// Receivers for each node's inbox (taken when endpoint is created).
    node_receivers: Mutex<HashMap<NodeId, Receiver<Vec<u8>>>>,
}

impl MockNetwork {
    /// Create a network for the given node ids.
    pub fn new<I: IntoIterator<Item = NodeId>>(node_ids: I) -> Self {
        let mut node_ids: Vec<NodeId> = node_ids.into_iter().collect();
        node_ids.sort_unstable();
        node_ids.dedup();

        let mut node_senders = HashMap::new();
        let mut node_receivers = HashMap::new();

        for &node_id in &node_ids {
            let (tx, rx) = unbounded();
            node_senders.insert(node_id, tx);
            node_receivers.insert(node_id, rx);
        }

        MockNetwork {
            node_ids,
            node_senders,
            node_receivers: Mutex::new(node_receivers),
        }
    }

    /// Create the endpoint for a node.
    ///
    /// The inbox can only be handed out once per node.
    pub fn create_endpoint(&self, node_id: NodeId) -> Result<Endpoint, ClusterError> {
        if !self.node_senders.contains_key(&node_id) {
            return Err(ClusterError::UnknownNode(node_id));
        }

        let inbox = self
            .node_receivers
            .lock()
            .map_err(|_| ClusterError::EndpointInUse(node_id))?
            .remove(&node_id)
            .ok_or(ClusterError::EndpointInUse(node_id))?;

        let tx_map = self
            .node_senders
            .iter()
            .filter(|(id, _)| **id != node_id)
            .map(|(&id, tx)| (id, tx.clone()))
            .collect();

        Ok(Endpoint {
            node_id,
            transport: Arc::new(MockSender {
                node_id,
                tx_map,
            }),
            inbox,
        })
    }

    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }
}
