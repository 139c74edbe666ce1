//! Handles addressing a role rather than a whole node.

use serde::{Deserialize, Serialize};

use corelib::{Handle, NodeId, RoleId, TransactionId};

/// A node handle scoped to one role of one transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoleHandle {
    pub node: Handle,
    pub transaction_id: TransactionId,
    pub role_id: RoleId,
}

impl RoleHandle {
    pub fn node_id(&self) -> NodeId {
        self.node.id
    }

    /// Derive a role handle `for_node` can use to reach the same role.
    pub fn transfer(&self, for_node: NodeId) -> Self {
        Self {
            node: self.node.transfer(for_node),
            transaction_id: self.transaction_id,
            role_id: self.role_id,
        }
    }
}
