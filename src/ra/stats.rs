use serde::Serialize;

/// Diagnostic counters for one node.
///
/// Read-only snapshot; nothing in the protocol consults these values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NodeStats {
    /// Times this node entered the critical section.
    pub cs_entries: u64,
    /// Send attempts that were delivered.
    pub messages_sent: u64,
    /// Send attempts that failed.
    pub messages_failed: u64,
    /// Send attempts after the first for the same message.
    pub messages_retried: u64,
    /// REQUESTs answered later instead of immediately.
    pub replies_deferred: u64,
    /// Calls to `request_critical_section` that started a request.
    pub requests_issued: u64,
    /// Requests abandoned after the request timeout.
    pub requests_cancelled: u64,
    /// Peers excluded after exhausting retries.
    pub peers_presumed_dead: u64,
    /// Inbound frames that could not be decoded.
    pub malformed_dropped: u64,
    /// Duplicate, stale or unexpected REPLYs ignored.
    pub stray_replies: u64,
}

impl NodeStats {
    /// Percentage of send attempts that were delivered.
    pub fn success_rate(&self) -> Option<f64> {
        let attempts = self.messages_sent + self.messages_failed;
        if attempts == 0 {
            return None;
        }
        Some(self.messages_sent as f64 * 100.0 / attempts as f64)
    }
}

impl std::fmt::Display for NodeStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "  Critical Section Entries: {}", self.cs_entries)?;
        writeln!(f, "  Messages Sent: {}", self.messages_sent)?;
        writeln!(f, "  Messages Failed: {}", self.messages_failed)?;
        writeln!(f, "  Messages Retried: {}", self.messages_retried)?;
        writeln!(f, "  Deferred Replies: {}", self.replies_deferred)?;
        writeln!(f, "  Requests Cancelled: {}", self.requests_cancelled)?;
        write!(f, "  Peers Presumed Dead: {}", self.peers_presumed_dead)?;
        if let Some(rate) = self.success_rate() {
            write!(f, "\n  Message Success Rate: {:.1}%", rate)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_rate() {
        let mut stats = NodeStats::default();
        assert_eq!(stats.success_rate(), None);

        stats.messages_sent = 3;
        stats.messages_failed = 1;
        assert_eq!(stats.success_rate(), Some(75.0));
    }
}
