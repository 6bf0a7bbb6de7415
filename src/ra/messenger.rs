//! Send path and receive path between a node and its transport.
//!
//! A [`Transport`] moves opaque frames and reports whether a frame was
//! accepted; delay and failure are properties of the transport. The
//! [`Messenger`] adds the codec and the bounded retry loop on top.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::message::{Codec, Message, MessageKind};
use super::NodeId;

/// How often the receive loop checks whether it has been closed.
const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Moves frames to peers.
pub trait Transport: Send + Sync {
    /// Hand a frame to `target`. Returns false if it was not delivered.
    fn send_frame(&self, target: NodeId, frame: Vec<u8>) -> bool;
}

/// Both halves of a node's connection to a network.
pub struct Endpoint {
    pub node_id: NodeId,
    pub transport: Arc<dyn Transport>,
    pub inbox: Receiver<Vec<u8>>,
}

/// Growth of the delay between attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay doubles after every failed attempt.
    Exponential,
}

/// Bounded retry for a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first (at least 1).
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub retry_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            retry_delay: Duration::from_secs(1),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after `failed_attempt` (1-based) before trying again.
    pub fn delay_after(&self, failed_attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => {
                let shift = failed_attempt.saturating_sub(1).min(16);
                self.retry_delay.saturating_mul(1u32 << shift)
            }
        }
    }
}

/// Outcome of delivering one message with retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub peer: NodeId,
    pub kind: MessageKind,
    /// Attempts made, including the successful one.
    pub attempts: u32,
    pub delivered: bool,
}

/// Codec plus retry on top of a transport.
///
/// Shared (via `Arc`) between the send workers and the receive loop of
/// one node. Holds no protocol state.
pub struct Messenger {
    node_id: NodeId,
    transport: Arc<dyn Transport>,
    codec: Codec,
    retry: RetryPolicy,
    malformed: AtomicU64,
    open: Arc<AtomicBool>,
}

impl Messenger {
    pub fn new(node_id: NodeId, transport: Arc<dyn Transport>, codec: Codec, retry: RetryPolicy) -> Self {
        Messenger {
            node_id,
            transport,
            codec,
            retry,
            malformed: AtomicU64::new(0),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Single attempt. False if the frame could not be encoded or the
    /// transport refused it.
    pub fn send(&self, peer: NodeId, message: &Message) -> bool {
        match self.codec.encode(message) {
            Ok(frame) => self.transport.send_frame(peer, frame),
            Err(e) => {
                warn!(node_id = self.node_id, peer, error = %e, "failed to encode message");
                false
            }
        }
    }

    /// Up to `max_attempts` attempts, sleeping between them.
    ///
    /// Blocks the calling thread for the retry delays; call it from a
    /// send worker, never from the node's inbound path.
    pub fn send_with_retry(&self, peer: NodeId, message: &Message) -> SendReport {
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            if self.send(peer, message) {
                return SendReport {
                    peer,
                    kind: message.kind(),
                    attempts,
                    delivered: true,
                };
            }

            debug!(
                node_id = self.node_id,
                peer,
                kind = %message.kind(),
                attempt = attempts,
                "send failed"
            );

            if attempts < max_attempts && self.is_open() {
                thread::sleep(self.retry.delay_after(attempts));
            }
        }

        warn!(
            node_id = self.node_id,
            peer,
            kind = %message.kind(),
            attempts,
            "giving up on message"
        );
        SendReport {
            peer,
            kind: message.kind(),
            attempts,
            delivered: false,
        }
    }

    /// Decode an inbound frame, dropping and counting it if malformed.
    pub fn decode(&self, frame: &[u8]) -> Option<Message> {
        match self.codec.decode(frame) {
            Ok(message) => Some(message),
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(node_id = self.node_id, error = %e, len = frame.len(), "dropping malformed frame");
                None
            }
        }
    }

    /// Register the inbound handler.
    ///
    /// Spawns the receive loop: every decodable frame from `inbox` is
    /// passed to `handler`, malformed ones are dropped. The loop ends when
    /// the messenger is closed or the inbox disconnects.
    pub fn on_receive<F>(
        self: &Arc<Self>,
        inbox: Receiver<Vec<u8>>,
        mut handler: F,
    ) -> std::io::Result<JoinHandle<()>>
    where
        F: FnMut(Message) + Send + 'static,
    {
        let messenger = Arc::clone(self);
        thread::Builder::new()
            .name(format!("ra-recv-{}", self.node_id))
            .spawn(move || {
                while messenger.is_open() {
                    match inbox.recv_timeout(RECEIVE_POLL_INTERVAL) {
                        Ok(frame) => {
                            if let Some(message) = messenger.decode(&frame) {
                                handler(message);
                            }
                        }
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
    }

    /// Number of inbound frames dropped as undecodable.
    pub fn malformed_count(&self) -> u64 {
        self.malformed.load(Ordering::Relaxed)
    }

    /// Stop the receive loop and cut retry sleeps short.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Transport that fails the first `failures` attempts, then delivers.
    struct FlakyTransport {
        failures: AtomicU64,
        delivered: Mutex<Vec<(NodeId, Vec<u8>)>>,
    }

    impl FlakyTransport {
        fn new(failures: u64) -> Self {
            FlakyTransport {
                failures: AtomicU64::new(failures),
                delivered: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transport for FlakyTransport {
        fn send_frame(&self, target: NodeId, frame: Vec<u8>) -> bool {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return false;
            }
            self.delivered.lock().unwrap().push((target, frame));
            true
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            retry_delay: Duration::from_millis(1),
            backoff: Backoff::Fixed,
        }
    }

    #[test]
    fn test_send_with_retry_recovers() {
        let transport = Arc::new(FlakyTransport::new(2));
        let messenger = Messenger::new(1, transport.clone(), Codec::Json, fast_retry(3));

        let msg = Message::Request { sender_id: 1, timestamp: 4 };
        let report = messenger.send_with_retry(2, &msg);

        assert!(report.delivered);
        assert_eq!(report.attempts, 3);
        assert_eq!(report.kind, MessageKind::Request);

        let delivered = transport.delivered.lock().unwrap();
        assert_eq!(delivered.len(), 1);
        assert_eq!(Codec::Json.decode(&delivered[0].1).unwrap(), msg);
    }

    #[test]
    fn test_send_with_retry_gives_up() {
        let transport = Arc::new(FlakyTransport::new(10));
        let messenger = Messenger::new(1, transport.clone(), Codec::Json, fast_retry(3));

        let report = messenger.send_with_retry(3, &Message::Reply { sender_id: 1, timestamp: None });
        assert!(!report.delivered);
        assert_eq!(report.attempts, 3);
        assert_eq!(transport.failures.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            retry_delay: Duration::from_millis(10),
            backoff: Backoff::Exponential,
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(10));
        assert_eq!(policy.delay_after(2), Duration::from_millis(20));
        assert_eq!(policy.delay_after(3), Duration::from_millis(40));

        let fixed = RetryPolicy::default();
        assert_eq!(fixed.delay_after(3), Duration::from_secs(1));
    }

    #[test]
    fn test_on_receive_drops_malformed() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let messenger = Arc::new(Messenger::new(
            2,
            Arc::new(FlakyTransport::new(0)),
            Codec::Json,
            fast_retry(1),
        ));

        let (seen_tx, seen_rx) = crossbeam_channel::unbounded();
        let handle = messenger
            .on_receive(rx, move |msg| {
                let _ = seen_tx.send(msg);
            })
            .unwrap();

        tx.send(b"garbage".to_vec()).unwrap();
        tx.send(br#"{"type":"REQUEST","sender_id":1,"timestamp":3}"#.to_vec()).unwrap();

        let received = seen_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(received, Message::Request { sender_id: 1, timestamp: 3 });
        assert_eq!(messenger.malformed_count(), 1);

        messenger.close();
        handle.join().unwrap();
    }
}
