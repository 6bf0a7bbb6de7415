//! Threaded Node Runner.
//!
//! Runs each protocol [`Node`] on its own thread. Everything that touches
//! the node's state goes through one event channel: decoded messages
//! from the receive loop, reports from the send workers, completion of
//! the critical work, and commands from the [`NodeHandle`]. Outbound
//! messages are handed to a small worker pool, so retries never block
//! inbound processing.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use crate::config::{ClusterConfig, ProtocolConfig, Settings};
use crate::error::ClusterError;
use crate::ra::message::{Codec, Message};
use crate::ra::messenger::{Endpoint, Messenger, RetryPolicy, SendReport};
use crate::ra::node::{Effect, Node, NodeState};
use crate::ra::stats::NodeStats;
use crate::ra::{NodeId, Timestamp};

use super::checker::{CheckResult, Checker, ProtocolEvent, SharedHistory};
use super::network::{ChaosConfig, ChaosNetwork};

/// How long an idle runner waits for an event before looking again.
const IDLE_POLL: Duration = Duration::from_millis(50);

/// How long a handle waits for the node thread to answer a query.
const QUERY_TIMEOUT: Duration = Duration::from_secs(1);

/// The work done while holding the critical section.
pub trait CriticalWork: Send + Sync {
    fn run(&self, node_id: NodeId);
}

impl<F> CriticalWork for F
where
    F: Fn(NodeId) + Send + Sync,
{
    fn run(&self, node_id: NodeId) {
        self(node_id)
    }
}

/// Holds the critical section for a fixed duration.
#[derive(Debug, Clone, Copy)]
pub struct SleepWork(pub Duration);

impl CriticalWork for SleepWork {
    fn run(&self, node_id: NodeId) {
        debug!(node_id, duration = ?self.0, "critical work");
        thread::sleep(self.0);
    }
}

/// Commands that can be sent to a node thread.
#[derive(Debug)]
pub enum NodeCommand {
    /// Ask for the critical section.
    RequestCriticalSection,
    /// Get the statistics snapshot.
    GetStatistics(Sender<NodeStats>),
    /// Get current state for verification.
    GetStatus(Sender<NodeStatus>),
    /// Stop the node thread.
    Shutdown,
}

/// Everything the node thread reacts to, in arrival order.
#[derive(Debug)]
enum NodeEvent {
    Inbound(Message),
    Sent(SendReport),
    WorkDone,
    Command(NodeCommand),
}

/// State snapshot from a node for verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub state: NodeState,
    pub clock: Timestamp,
    pub request_timestamp: Option<Timestamp>,
    pub pending: usize,
    pub deferred: usize,
    pub failed_peers: Vec<NodeId>,
}

/// Configuration for creating a node.
#[derive(Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub cluster: Arc<ClusterConfig>,
    pub codec: Codec,
    pub retry: RetryPolicy,
    pub request_timeout: Option<Duration>,
    pub dispatch_workers: usize,
    pub work: Arc<dyn CriticalWork>,
}

impl NodeConfig {
    pub fn new(
        node_id: NodeId,
        cluster: Arc<ClusterConfig>,
        protocol: &ProtocolConfig,
        work: Arc<dyn CriticalWork>,
    ) -> Self {
        NodeConfig {
            node_id,
            cluster,
            codec: protocol.codec,
            retry: protocol.retry_policy(),
            request_timeout: protocol.request_timeout(),
            dispatch_workers: protocol.dispatch_workers,
            work,
        }
    }
}

/// Pool of threads delivering outbound messages with retries.
///
/// Every finished delivery is reported back into the node's event
/// channel, which is where its bookkeeping happens.
struct Dispatcher {
    jobs: Option<Sender<(NodeId, Message)>>,
    workers: Vec<JoinHandle<()>>,
}

impl Dispatcher {
    fn start(
        node_id: NodeId,
        workers: usize,
        messenger: Arc<Messenger>,
        events: Sender<NodeEvent>,
    ) -> std::io::Result<Self> {
        let (jobs_tx, jobs_rx) = unbounded::<(NodeId, Message)>();
        let mut handles = Vec::with_capacity(workers.max(1));

        for worker in 0..workers.max(1) {
            let jobs = jobs_rx.clone();
            let messenger = messenger.clone();
            let events = events.clone();
            let handle = thread::Builder::new()
                .name(format!("ra-send-{}-{}", node_id, worker))
                .spawn(move || {
                    for (peer, message) in jobs.iter() {
                        let report = messenger.send_with_retry(peer, &message);
                        if events.send(NodeEvent::Sent(report)).is_err() {
                            break;
                        }
                    }
                })?;
            handles.push(handle);
        }

        Ok(Dispatcher {
            jobs: Some(jobs_tx),
            workers: handles,
        })
    }

    fn dispatch(&self, peer: NodeId, message: Message) {
        if let Some(jobs) = &self.jobs {
            let _ = jobs.send((peer, message));
        }
    }

    /// Stop accepting jobs and wait for in-flight deliveries.
    fn shutdown(&mut self) {
        self.jobs.take();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

/// Handle to a running node thread.
pub struct NodeHandle {
    pub node_id: NodeId,
    events_tx: Sender<NodeEvent>,
    thread_handle: Option<JoinHandle<()>>,
}

impl NodeHandle {
    /// Ask the node for the critical section. Returns immediately;
    /// false if the node thread is gone.
    pub fn request_critical_section(&self) -> bool {
        self.command(NodeCommand::RequestCriticalSection)
    }

    /// Get the node's statistics snapshot.
    pub fn get_statistics(&self) -> Option<NodeStats> {
        let (resp_tx, resp_rx) = bounded(1);
        if self.command(NodeCommand::GetStatistics(resp_tx)) {
            resp_rx.recv_timeout(QUERY_TIMEOUT).ok()
        } else {
            None
        }
    }

    /// Get current node state.
    pub fn status(&self) -> Option<NodeStatus> {
        let (resp_tx, resp_rx) = bounded(1);
        if self.command(NodeCommand::GetStatus(resp_tx)) {
            resp_rx.recv_timeout(QUERY_TIMEOUT).ok()
        } else {
            None
        }
    }

    pub fn state(&self) -> Option<NodeState> {
        self.status().map(|s| s.state)
    }

    /// Stop the node thread and wait for it. Safe to call twice.
    pub fn shutdown(&mut self) {
        let _ = self.events_tx.send(NodeEvent::Command(NodeCommand::Shutdown));
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread_handle.is_some()
    }

    fn command(&self, command: NodeCommand) -> bool {
        self.thread_handle.is_some() && self.events_tx.send(NodeEvent::Command(command)).is_ok()
    }
}

/// The node runner that executes in its own thread.
struct NodeRunner {
    node: Node,
    messenger: Arc<Messenger>,
    dispatcher: Dispatcher,
    receiver: Option<JoinHandle<()>>,
    events_tx: Sender<NodeEvent>,
    events_rx: Receiver<NodeEvent>,
    history: SharedHistory,
    work: Arc<dyn CriticalWork>,
    request_timeout: Option<Duration>,
    deadline: Option<Instant>,
}

impl NodeRunner {
    fn run(&mut self) {
        let node_id = self.node.node_id();
        info!(node_id, peers = ?self.node.peers(), "node started");

        loop {
            let wait = self
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now()))
                .unwrap_or(IDLE_POLL);

            match self.events_rx.recv_timeout(wait) {
                Ok(NodeEvent::Command(NodeCommand::Shutdown)) => break,
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }

            self.check_deadline();
        }

        self.messenger.close();
        self.dispatcher.shutdown();
        if let Some(receiver) = self.receiver.take() {
            let _ = receiver.join();
        }
        info!(node_id, stats = ?self.statistics(), "node stopped");
    }

    fn handle_event(&mut self, event: NodeEvent) {
        match event {
            NodeEvent::Inbound(message) => {
                let effects = self.node.handle_message(message);
                self.apply(effects);
            }
            NodeEvent::Sent(report) => {
                let failed_before = self.node.failed_peers();
                let effects = self.node.on_send_report(&report);
                for peer in self.node.failed_peers().iter() {
                    if !failed_before.contains(peer) {
                        self.history.record(ProtocolEvent::PeerPresumedDead {
                            node_id: self.node.node_id(),
                            peer,
                        });
                    }
                }
                self.apply(effects);
            }
            NodeEvent::WorkDone => {
                let effects = self.node.exit_critical_section();
                self.apply(effects);
            }
            NodeEvent::Command(NodeCommand::RequestCriticalSection) => {
                let was_idle = self.node.state() == NodeState::Idle;
                let effects = self.node.request_critical_section();
                if let (true, Some(request)) = (was_idle, self.node.current_request()) {
                    self.history.record(ProtocolEvent::Requested { request });
                    self.deadline = self.request_timeout.map(|t| Instant::now() + t);
                }
                self.apply(effects);
            }
            NodeEvent::Command(NodeCommand::GetStatistics(resp_tx)) => {
                let _ = resp_tx.send(self.statistics());
            }
            NodeEvent::Command(NodeCommand::GetStatus(resp_tx)) => {
                let _ = resp_tx.send(self.status());
            }
            NodeEvent::Command(NodeCommand::Shutdown) => {}
        }
    }

    fn check_deadline(&mut self) {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                self.deadline = None;
                let effects = self.node.on_request_timeout();
                self.apply(effects);
            }
            _ => {}
        }
    }

    /// Carry out effects. State changes are recorded before any message
    /// leaves, so the history never shows a successor entering before
    /// this node's exit.
    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in &effects {
            match *effect {
                Effect::Entered { request } => {
                    self.deadline = None;
                    self.history.record(ProtocolEvent::Entered { request });
                    self.start_work();
                }
                Effect::Exited => {
                    self.history.record(ProtocolEvent::Exited {
                        node_id: self.node.node_id(),
                    });
                }
                Effect::Cancelled { request } => {
                    self.deadline = None;
                    self.history.record(ProtocolEvent::Cancelled { request });
                }
                Effect::Send { .. } => {}
            }
        }

        for effect in effects {
            if let Effect::Send { to, message } = effect {
                self.dispatcher.dispatch(to, message);
            }
        }
    }

    fn start_work(&mut self) {
        let node_id = self.node.node_id();
        let work = self.work.clone();
        let done = self.events_tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("ra-work-{}", node_id))
            .spawn(move || {
                work.run(node_id);
                let _ = done.send(NodeEvent::WorkDone);
            });

        if let Err(e) = spawned {
            error!(node_id, error = %e, "failed to start critical work, exiting at once");
            let _ = self.events_tx.send(NodeEvent::WorkDone);
        }
    }

    fn statistics(&self) -> NodeStats {
        let mut stats = self.node.stats();
        stats.malformed_dropped = self.messenger.malformed_count();
        stats
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.node.node_id(),
            state: self.node.state(),
            clock: self.node.clock(),
            request_timestamp: self.node.request_timestamp(),
            pending: self.node.pending().len(),
            deferred: self.node.deferred().len(),
            failed_peers: self.node.failed_peers().iter().collect(),
        }
    }
}

/// Spawn a node in its own thread.
///
/// The node's receive loop and send workers are started here, so a
/// failure to start any of them is reported to the caller.
pub fn spawn_node(
    config: NodeConfig,
    endpoint: Endpoint,
    history: SharedHistory,
) -> Result<NodeHandle, ClusterError> {
    let node_id = config.node_id;
    let node = Node::new(node_id, &config.cluster)?;
    let spawn_err = |source| ClusterError::Spawn { node_id, source };

    let messenger = Arc::new(Messenger::new(
        node_id,
        endpoint.transport,
        config.codec,
        config.retry,
    ));
    let (events_tx, events_rx) = unbounded();

    let dispatcher = Dispatcher::start(
        node_id,
        config.dispatch_workers,
        messenger.clone(),
        events_tx.clone(),
    )
    .map_err(spawn_err)?;

    let inbound = events_tx.clone();
    let receiver = messenger
        .on_receive(endpoint.inbox, move |message| {
            let _ = inbound.send(NodeEvent::Inbound(message));
        })
        .map_err(spawn_err)?;

    let mut runner = NodeRunner {
        node,
        messenger,
        dispatcher,
        receiver: Some(receiver),
        events_tx: events_tx.clone(),
        events_rx,
        history,
        work: config.work,
        request_timeout: config.request_timeout,
        deadline: None,
    };

    let thread_handle = thread::Builder::new()
        .name(format!("ra-node-{}", node_id))
        .spawn(move || runner.run())
        .map_err(spawn_err)?;

    Ok(NodeHandle {
        node_id,
        events_tx,
        thread_handle: Some(thread_handle),
    })
}

/// Cluster manager for coordinating multiple nodes.
pub struct ClusterManager {
    nodes: Vec<NodeHandle>,
    network: Arc<ChaosNetwork>,
    history: SharedHistory,
    cluster: Arc<ClusterConfig>,
}

impl ClusterManager {
    /// Bring up every member of `cluster` on a fresh chaos network.
    pub fn start(
        cluster: ClusterConfig,
        protocol: &ProtocolConfig,
        chaos: ChaosConfig,
        work: Arc<dyn CriticalWork>,
    ) -> Result<Self, ClusterError> {
        protocol.validate()?;
        let cluster = Arc::new(cluster);
        let network = Arc::new(ChaosNetwork::new(cluster.node_ids(), chaos));
        let history = SharedHistory::new();

        let mut manager = ClusterManager {
            nodes: Vec::with_capacity(cluster.len()),
            network,
            history,
            cluster: cluster.clone(),
        };

        for node_id in cluster.node_ids() {
            let endpoint = manager.network.create_endpoint(node_id)?;
            let config = NodeConfig::new(node_id, cluster.clone(), protocol, work.clone());
            // Dropping the manager on error stops the nodes already started.
            let handle = spawn_node(config, endpoint, manager.history.clone())?;
            manager.nodes.push(handle);
        }

        info!(nodes = manager.nodes.len(), "cluster started");
        Ok(manager)
    }

    /// Bring up the cluster described by loaded settings.
    pub fn from_settings(settings: &Settings, work: Arc<dyn CriticalWork>) -> Result<Self, ClusterError> {
        settings.validate()?;
        Self::start(
            settings.cluster.clone(),
            &settings.protocol,
            settings.chaos.to_chaos_config(),
            work,
        )
    }

    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    pub fn network(&self) -> &ChaosNetwork {
        &self.network
    }

    pub fn history(&self) -> &SharedHistory {
        &self.history
    }

    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeHandle> {
        self.nodes.iter().find(|n| n.node_id == node_id)
    }

    /// Ask `node_id` for the critical section.
    pub fn request_critical_section(&self, node_id: NodeId) -> bool {
        self.node(node_id)
            .map(|n| n.request_critical_section())
            .unwrap_or(false)
    }

    /// Kill a node: stop its thread and cut it off the network.
    pub fn kill_node(&mut self, node_id: NodeId) -> bool {
        if let Some(node) = self.nodes.iter_mut().find(|n| n.node_id == node_id) {
            if node.is_running() {
                self.network.kill_node(node_id);
                node.shutdown();
                warn!(node_id, "node killed");
                return true;
            }
        }
        false
    }

    /// Wait until every running node is idle.
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < timeout {
            let all_idle = self
                .nodes
                .iter()
                .filter(|n| n.is_running())
                .all(|n| n.state() == Some(NodeState::Idle));
            if all_idle {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }

        false
    }

    /// Wait until the cluster has entered the critical section `count`
    /// times in total.
    pub fn wait_for_entries(&self, count: usize, timeout: Duration) -> bool {
        let start = Instant::now();

        while start.elapsed() < timeout {
            if self.history.snapshot().entry_order().len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }

        false
    }

    /// Statistics of every running node.
    pub fn all_statistics(&self) -> Vec<(NodeId, NodeStats)> {
        self.nodes
            .iter()
            .filter_map(|n| n.get_statistics().map(|s| (n.node_id, s)))
            .collect()
    }

    /// Check the recorded history.
    pub fn verify(&self) -> CheckResult {
        Checker::new().verify(&self.history.snapshot())
    }

    /// Stop all nodes.
    pub fn shutdown_all(&mut self) {
        for node in &mut self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for ClusterManager {
    fn drop(&mut self) {
        self.shutdown_all();
    }
}
