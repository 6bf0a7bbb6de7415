//! Lamport logical clock.

use super::Timestamp;

/// Per-node Lamport clock.
///
/// Starts at zero and never decreases. `tick` is applied to locally
/// initiated events, `observe` to every inbound message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogicalClock(Timestamp);

impl LogicalClock {
    /// Create a clock at zero.
    pub fn new() -> Self {
        LogicalClock(0)
    }

    /// Advance for a local event and return the new value.
    #[inline]
    pub fn tick(&mut self) -> Timestamp {
        self.0 = self.0.saturating_add(1);
        self.0
    }

    /// Lamport's receive rule: `max(local, remote) + 1`.
    #[inline]
    pub fn observe(&mut self, remote: Timestamp) -> Timestamp {
        self.0 = self.0.max(remote).saturating_add(1);
        self.0
    }

    /// Current value without advancing.
    #[inline]
    pub fn now(&self) -> Timestamp {
        self.0
    }
}
