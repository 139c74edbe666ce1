//! Timing and policy configuration for a node.
//!
//! Every interval is a plain number of milliseconds with a default taken from
//! long-running deployments; any of them can be overridden by the surrounding
//! deployment through serde (missing fields keep their defaults).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Intervals driving retransmission and acknowledgement housekeeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long an envelope may stay unacknowledged before it is retransmitted.
    pub pending_expiration_ms: u64,
    /// Batching window before an exporter flushes fresh envelopes. 0 sends
    /// every envelope as soon as it is exported.
    pub send_interval_ms: u64,
    /// Time between acknowledgement rounds sent to senders.
    pub acknowledgement_interval_ms: u64,
    /// Time between checks for expired pending envelopes.
    pub retransmission_check_interval_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pending_expiration_ms: 2_000,
            send_interval_ms: 0,
            acknowledgement_interval_ms: 30,
            retransmission_check_interval_ms: 20,
        }
    }
}

impl TimingConfig {
    pub fn pending_expiration(&self) -> Duration {
        Duration::from_millis(self.pending_expiration_ms)
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_millis(self.send_interval_ms)
    }

    pub fn acknowledgement_interval(&self) -> Duration {
        Duration::from_millis(self.acknowledgement_interval_ms)
    }

    pub fn retransmission_check_interval(&self) -> Duration {
        Duration::from_millis(self.retransmission_check_interval_ms)
    }
}

/// What a node does with an `enlist` that arrives while it is busy with a
/// role of a different transaction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnlistPolicy {
    /// Queue the new role; it starts once the running role completes.
    #[default]
    Queue,
    /// Refuse the new role and tell the enlisting role.
    Reject,
}

/// What an importer does with an envelope whose sequence number is ahead of
/// the next expected one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPolicy {
    /// Refuse it as a protocol violation; the sender's retransmission will
    /// eventually fill the gap in order.
    #[default]
    Reject,
    /// Keep it until the gap is filled, then deliver in order.
    Buffer,
}

/// Per-node settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    pub timing: TimingConfig,
    pub enlist_policy: EnlistPolicy,
    pub gap_policy: GapPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override_keeps_defaults() {
        let timing: TimingConfig = serde_json::from_str(r#"{"pending_expiration_ms": 50}"#).unwrap();
        assert_eq!(timing.pending_expiration(), Duration::from_millis(50));
        assert_eq!(timing.acknowledgement_interval_ms, 30);
        assert_eq!(timing.retransmission_check_interval_ms, 20);
    }

    #[test]
    fn test_policies_parse_snake_case() {
        let settings: NodeSettings =
            serde_json::from_str(r#"{"enlist_policy": "reject", "gap_policy": "buffer"}"#).unwrap();
        assert_eq!(settings.enlist_policy, EnlistPolicy::Reject);
        assert_eq!(settings.gap_policy, GapPolicy::Buffer);
        assert_eq!(settings.timing, TimingConfig::default());
    }
}
