//! Transaction and role ids, and the per-node generator that mints them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_128;

use crate::node::{define_id, NodeId};

define_id!(
    /// Unique id shared by every role of one transaction.
    TransactionId
);

define_id!(
    /// Unique id of one role within a transaction.
    RoleId
);

/// Deterministic id source owned by a single node.
///
/// Ids are the xxh3-128 hash of `(domain, node id, counter)`. Two nodes never
/// share a generator, so ids minted by different nodes differ with
/// overwhelming probability, and a replayed simulation mints the same ids.
#[derive(Debug, Clone)]
pub struct IdGenerator {
    node: NodeId,
    counter: u64,
}

impl IdGenerator {
    pub fn new(node: NodeId) -> Self {
        Self { node, counter: 0 }
    }

    fn next(&mut self, domain: u8) -> u128 {
        let mut buf = [0u8; 25];
        buf[0] = domain;
        buf[1..17].copy_from_slice(&self.node.0.to_le_bytes());
        buf[17..25].copy_from_slice(&self.counter.to_le_bytes());
        self.counter += 1;
        xxh3_128(&buf)
    }

    pub fn transaction_id(&mut self) -> TransactionId {
        TransactionId(self.next(1))
    }

    pub fn role_id(&mut self) -> RoleId {
        RoleId(self.next(2))
    }

    pub fn node_id(&mut self) -> NodeId {
        NodeId(self.next(3))
    }

    /// A fresh secret for a node about to be spawned.
    pub fn secret(&mut self) -> u64 {
        self.next(4) as u64
    }
}
