//! The hardware abstraction this core consumes.
//!
//! A physical, virtual or simulated machine layer delivers raw frames to nodes,
//! drives time forward with `elapse` calls, and creates or terminates nodes.
//! The messaging and transaction layers only ever talk to it through this
//! trait; they never own sockets, threads or clocks.

use bytes::Bytes;

use crate::error::HardwareError;
use crate::network::Handle;
use crate::node::{ControllerId, NodeConfig, NodeId};

/// Machine services available to a node.
///
/// Implementations are free to lose, duplicate, delay or reorder frames
/// between different sender/receiver pairs; the messaging layer absorbs all of
/// that. `send` is fire-and-forget.
pub trait Hardware {
    /// The controller hosting the calling node.
    fn controller_id(&self) -> ControllerId;

    /// True when `receiver` currently names a node `sender` can send to.
    fn is_reachable(&self, sender: NodeId, receiver: &Handle) -> bool;

    /// Best-effort transmission of one encoded frame.
    fn send(&mut self, sender: NodeId, receiver: &Handle, payload: Bytes) -> Result<(), HardwareError>;

    /// Create a new node from `config`, returning the controller that hosts it.
    fn spawn_node(&mut self, config: NodeConfig) -> Result<ControllerId, HardwareError>;

    /// Stop a node and drop everything addressed to it.
    fn terminate_node(&mut self, node: NodeId) -> Result<(), HardwareError>;
}
