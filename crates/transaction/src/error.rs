//! Errors surfaced to role procedures.

use thiserror::Error;

use corelib::{HardwareError, NodeId};

pub type Result<T> = std::result::Result<T, TransactionError>;

/// Outcomes a role procedure must react to.
///
/// Loss, duplication and delay never show up here: the messaging layer
/// absorbs them. What remains are failures the application has to handle
/// itself, usually by aborting its transaction.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error(transparent)]
    Core(#[from] corelib::Error),

    /// The enlisted node was busy and its policy is to reject.
    #[error("enlisting {node} was rejected: node is busy")]
    EnlistRejected { node: NodeId },

    /// The procedure gave up.
    #[error("transaction aborted: {0}")]
    Aborted(String),
}

impl From<HardwareError> for TransactionError {
    fn from(e: HardwareError) -> Self {
        TransactionError::Core(e.into())
    }
}

impl TransactionError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, TransactionError::Core(e) if e.is_unreachable())
    }
}
