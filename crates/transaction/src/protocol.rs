//! Message types the transaction layer reserves for itself.

use serde::{Deserialize, Serialize};

use corelib::{RoleId, TransactionId};

use crate::handle::RoleHandle;

/// Body type of the message asking a node to host a participant role.
pub const START_PARTICIPANT_ROLE: &str = "start_participant_role";

/// Body type sent back to an enlister whose target refused the role.
pub const ENLIST_REJECTED: &str = "enlist_rejected";

/// Fields of a `start_participant_role` message. The envelope carries the
/// transaction and role ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartParticipantRole<T> {
    pub participant: T,
    /// Lets the new role talk back to the role that enlisted it.
    pub enlister: RoleHandle,
}

/// The participant a freshly spawned node starts with, stored in its
/// `NodeConfig::start_participant_role`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedParticipant<T> {
    pub transaction_id: TransactionId,
    pub role_id: RoleId,
    pub participant: T,
    pub enlister: RoleHandle,
}

/// Fields of an `enlist_rejected` message. The envelope is addressed to the
/// enlister's role; the body names the participant that was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnlistRejected {
    pub rejected_role_id: RoleId,
}

/// True for body types roles may not send themselves.
pub fn is_reserved(kind: &str) -> bool {
    kind == START_PARTICIPANT_ROLE || kind == ENLIST_REJECTED
}
