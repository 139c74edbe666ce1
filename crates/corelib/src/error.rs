//! Error types shared by every crate in the workspace.
//!
//! Only conditions a caller must react to are errors. Duplicate envelopes and
//! retransmission timeouts are part of normal operation and are reported as
//! outcomes and log lines instead.

use thiserror::Error;

use crate::node::NodeId;

/// Result type alias for the core library.
pub type Result<T> = std::result::Result<T, Error>;

/// Failures reported by a `Hardware` implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HardwareError {
    /// No transport has been initialized between sender and receiver.
    #[error("no transport has been initialized between sender {sender} and receiver {receiver}")]
    NoTransport { sender: NodeId, receiver: NodeId },

    /// No node with this id is hosted here.
    #[error("no node for id {0}")]
    NoNodeForId(NodeId),

    /// A node with this id already exists.
    #[error("node {0} already exists")]
    NodeExists(NodeId),
}

/// Errors that can occur in the messaging and transaction layers.
#[derive(Debug, Error)]
pub enum Error {
    /// No usable transport from `sender` to `receiver`.
    #[error("peer {receiver} is unreachable from {sender}")]
    UnreachablePeer { sender: NodeId, receiver: NodeId },

    /// A collaborator broke the protocol (out-of-order sequence number,
    /// envelope for an unknown transaction or role, malformed frame).
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An internal invariant would have been broken.
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),

    /// An envelope or frame failed to encode or decode.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error(transparent)]
    Hardware(#[from] HardwareError),
}

impl Error {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::UnreachablePeer { .. })
    }

    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Error::ProtocolViolation(_) | Error::Codec(_))
    }
}
