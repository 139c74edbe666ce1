//! Handles and transports: the capabilities that let one node reach another.
//!
//! A `Handle` identifies a receiver to exactly one sender. It is never mutated
//! once issued; to let a third node reach the same receiver, the holder derives
//! a new handle with [`Handle::transfer`]. The `Transport` inside a handle is
//! the per-(sender, receiver) material that travels with every frame; it only
//! works in the sender to receiver direction.
//!
//! # Verification
//!
//! Material is a keyed SipHash chain rooted in the receiver's secret. The
//! first holder's material is keyed by the secret itself; every transfer keys
//! the next link with the previous holder's material. Only the receiver knows
//! the secret, so only the receiver can check a transport, which it does with
//! [`Identity::accepts`] on every inbound frame. Handles never carry the
//! secret.

use std::hash::Hasher;

use serde::{Deserialize, Serialize};
use siphasher::sip::SipHasher13;

use crate::node::{ControllerId, NodeId};

/// Connection material for one sender to receiver direction.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Transport {
    pub sender: NodeId,
    pub receiver: NodeId,
    /// Earlier holders, oldest first, when this transport came from transfers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub via: Vec<NodeId>,
    /// Keyed hash chain proving the receiver authorized this sender.
    pub material: u64,
}

fn link(key: u64, receiver: NodeId, holder: NodeId) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(key, receiver.0 as u64);
    hasher.write(&holder.0.to_le_bytes());
    hasher.finish()
}

impl Transport {
    /// Derive the transport a `sender` uses to reach `receiver`.
    ///
    /// # Performance
    /// - **Time**: O(1) - one SipHash-1-3 over 16 bytes
    pub fn derive(receiver: NodeId, secret: u64, sender: NodeId) -> Self {
        Self {
            sender,
            receiver,
            via: Vec::new(),
            material: link(secret, receiver, sender),
        }
    }

    /// Extend the chain so that `sender` may use it.
    pub fn extend(&self, sender: NodeId) -> Self {
        let mut via = self.via.clone();
        via.push(self.sender);
        Self {
            sender,
            receiver: self.receiver,
            via,
            material: link(self.material, self.receiver, sender),
        }
    }

    /// True if this transport was derived from the receiver's `secret`.
    ///
    /// # Performance
    /// - **Time**: O(transfers) - one SipHash per link in the chain
    pub fn verify(&self, secret: u64) -> bool {
        let mut holders = self.via.iter().chain(std::iter::once(&self.sender));
        let Some(first) = holders.next() else {
            return false;
        };
        let material = holders.fold(link(secret, self.receiver, *first), |key, holder| {
            link(key, self.receiver, *holder)
        });
        material == self.material
    }
}

/// A capability identifying a receiver node to exactly one sender.
///
/// Wire shape: `{id, controller_id, transport}` where `transport` names the
/// sender the handle was issued to.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle {
    pub id: NodeId,
    pub controller_id: ControllerId,
    pub transport: Transport,
}

impl Handle {
    /// Issue a handle that `for_sender` can use to reach `receiver`.
    ///
    /// Only the receiver (or whoever created it and so knows `secret`) can
    /// issue handles the receiver will accept.
    pub fn issue(receiver: NodeId, controller_id: ControllerId, secret: u64, for_sender: NodeId) -> Self {
        Self {
            id: receiver,
            controller_id,
            transport: Transport::derive(receiver, secret, for_sender),
        }
    }

    /// Derive a new handle that lets `for_sender` reach the same receiver.
    ///
    /// The result never shares transport material with `self`.
    pub fn transfer(&self, for_sender: NodeId) -> Self {
        if for_sender == self.transport.sender {
            return self.clone();
        }
        Self {
            id: self.id,
            controller_id: self.controller_id,
            transport: self.transport.extend(for_sender),
        }
    }

    /// The sender this handle was issued to.
    #[inline]
    pub fn sender(&self) -> NodeId {
        self.transport.sender
    }

    /// True when `sender` is the node this handle was issued or transferred
    /// to. Whether the material is genuine is for the receiver to decide.
    pub fn usable_by(&self, sender: NodeId) -> bool {
        self.transport.sender == sender && self.transport.receiver == self.id
    }
}

/// What a node needs to issue handles to itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Identity {
    pub node: NodeId,
    pub controller_id: ControllerId,
    secret: u64,
}

impl Identity {
    pub fn new(node: NodeId, controller_id: ControllerId, secret: u64) -> Self {
        Self {
            node,
            controller_id,
            secret,
        }
    }

    /// A handle `for_sender` can use to reach this node.
    pub fn new_handle(&self, for_sender: NodeId) -> Handle {
        Handle::issue(self.node, self.controller_id, self.secret, for_sender)
    }

    /// True when `transport` is genuine material for reaching this node.
    pub fn accepts(&self, transport: &Transport) -> bool {
        transport.receiver == self.node && transport.verify(self.secret)
    }
}

/// Handle describing a machine controller.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ControllerHandle {
    pub id: ControllerId,
    #[serde(rename = "type")]
    pub kind: String,
}
