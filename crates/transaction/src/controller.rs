//! Capabilities handed to application code while it runs on a node.
//!
//! [`NodeContext`] is what any handler on a node may do: touch node state,
//! send plain messages, start transactions. [`RoleController`] adds what only
//! a running role may do: enlist peers, spawn nodes and exchange role-scoped
//! messages. Both borrow the node for the duration of one step, so no role can
//! hold on to them across a suspension.

use tracing::{debug, info};

use corelib::{
    Body, Envelope, EnvelopeId, Handle, Hardware, NodeConfig, NodeId, RoleId, TransactionId,
};
use messaging::Linker;

use crate::error::Result;
use crate::handle::RoleHandle;
use crate::node::NodeCore;
use crate::protocol::{self, SpawnedParticipant, StartParticipantRole, START_PARTICIPANT_ROLE};
use crate::role::{Listen, Program, Step};

pub struct NodeContext<'a, P: Program> {
    core: &'a mut NodeCore<P>,
    hardware: &'a mut dyn Hardware,
    /// Inbound envelope being processed; every export is attributed to it.
    cause: Option<EnvelopeId>,
    started: &'a mut Vec<(TransactionId, P::Originator)>,
}

impl<'a, P: Program> NodeContext<'a, P> {
    pub(crate) fn new(
        core: &'a mut NodeCore<P>,
        hardware: &'a mut dyn Hardware,
        cause: Option<EnvelopeId>,
        started: &'a mut Vec<(TransactionId, P::Originator)>,
    ) -> Self {
        Self {
            core,
            hardware,
            cause,
            started,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.core.identity.node
    }

    pub fn now_ms(&self) -> u64 {
        self.core.linker.now_ms()
    }

    /// The node's private state.
    pub fn state(&mut self) -> &mut P::State {
        &mut self.core.state
    }

    pub fn linker(&self) -> &Linker {
        &self.core.linker
    }

    /// A handle `for_node` can use to reach this node.
    pub fn new_handle(&self, for_node: NodeId) -> Handle {
        self.core.identity.new_handle(for_node)
    }

    /// A config for a node this node is about to spawn, with fresh id and
    /// secret and this node's settings.
    pub fn new_node_config(&mut self) -> NodeConfig {
        let id = self.core.ids.node_id();
        let secret = self.core.ids.secret();
        NodeConfig::new(id, secret).with_settings(self.core.settings)
    }

    /// Send a message outside of any transaction.
    pub fn send(&mut self, receiver: &Handle, body: Body) -> Result<()> {
        let envelope = Envelope::new(0, body).with_cause(self.cause);
        self.core.export(self.hardware, receiver, envelope)?;
        Ok(())
    }

    /// Start a transaction with `originator` once the current step is over.
    pub fn start_transaction(&mut self, originator: P::Originator) -> TransactionId {
        let transaction_id = self.core.ids.transaction_id();
        self.started.push((transaction_id, originator));
        transaction_id
    }
}

/// What a running role may do. Only exists for the duration of one step.
pub struct RoleController<'a, P: Program> {
    node: NodeContext<'a, P>,
    transaction_id: TransactionId,
    role_id: RoleId,
    enlister: Option<RoleHandle>,
}

impl<'a, P: Program> RoleController<'a, P> {
    pub(crate) fn new(
        node: NodeContext<'a, P>,
        transaction_id: TransactionId,
        role_id: RoleId,
        enlister: Option<RoleHandle>,
    ) -> Self {
        Self {
            node,
            transaction_id,
            role_id,
            enlister,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    pub fn role_id(&self) -> RoleId {
        self.role_id
    }

    pub fn node_id(&self) -> NodeId {
        self.node.node_id()
    }

    /// The role that enlisted this one. `None` for originators.
    pub fn enlister(&self) -> Option<&RoleHandle> {
        self.enlister.as_ref()
    }

    pub fn node(&mut self) -> &mut NodeContext<'a, P> {
        &mut self.node
    }

    /// The node's private state. No locking: nothing else runs on this node
    /// while the role does.
    pub fn state(&mut self) -> &mut P::State {
        self.node.state()
    }

    /// A handle `for_node` can use to send to this role.
    pub fn new_role_handle(&self, for_node: NodeId) -> RoleHandle {
        RoleHandle {
            node: self.node.new_handle(for_node),
            transaction_id: self.transaction_id,
            role_id: self.role_id,
        }
    }

    /// Ask the node behind `node` to host `participant` for this transaction.
    ///
    /// The start message goes through the node's exporter, so it is delivered
    /// exactly once; the target additionally ignores a second start for the
    /// same role id. The participant runs once the target's single role slot
    /// is free.
    ///
    /// # Errors
    /// `UnreachablePeer` when `node` is not a handle this node may use.
    pub fn enlist(&mut self, node: &Handle, participant: P::Participant) -> Result<RoleHandle> {
        let role_id = self.node.core.ids.role_id();
        let record = StartParticipantRole {
            participant,
            enlister: self.new_role_handle(node.id),
        };
        let envelope = Envelope::new(0, Body::from_record(START_PARTICIPANT_ROLE, &record)?)
            .scoped(self.transaction_id, Some(role_id))
            .with_cause(self.node.cause);
        self.node.core.export(self.node.hardware, node, envelope)?;

        info!(
            node = %self.node_id(),
            transaction_id = %self.transaction_id,
            participant = %node.id,
            role_id = %role_id,
            "enlisted participant"
        );
        Ok(RoleHandle {
            node: node.clone(),
            transaction_id: self.transaction_id,
            role_id,
        })
    }

    /// Create a node from `config` whose first role is `participant`.
    ///
    /// The participant record travels inside the config, so no start message
    /// is needed.
    pub fn spawn_enlist(&mut self, mut config: NodeConfig, participant: P::Participant) -> Result<RoleHandle> {
        let role_id = self.node.core.ids.role_id();
        let record = SpawnedParticipant {
            transaction_id: self.transaction_id,
            role_id,
            participant,
            enlister: self.new_role_handle(config.id),
        };
        config.start_participant_role = Some(serde_json::to_value(&record).map_err(corelib::Error::from)?);

        let (node_id, secret) = (config.id, config.secret);
        let controller_id = self.node.hardware.spawn_node(config)?;
        info!(
            node = %self.node_id(),
            transaction_id = %self.transaction_id,
            spawned = %node_id,
            role_id = %role_id,
            "spawned participant node"
        );
        Ok(RoleHandle {
            node: Handle::issue(node_id, controller_id, secret, self.node_id()),
            transaction_id: self.transaction_id,
            role_id,
        })
    }

    /// Send `body` to another role of this or any transaction.
    ///
    /// # Errors
    /// - `ProtocolViolation` for body types reserved by the transaction layer.
    /// - `UnreachablePeer` when the role handle's node handle is not ours to use.
    pub fn send(&mut self, to: &RoleHandle, body: Body) -> Result<()> {
        if protocol::is_reserved(&body.kind) {
            return Err(corelib::Error::ProtocolViolation(format!(
                "roles may not send {:?} messages",
                body.kind
            ))
            .into());
        }
        debug!(
            node = %self.node_id(),
            transaction_id = %to.transaction_id,
            role_id = %to.role_id,
            kind = %body.kind,
            "sending role message"
        );
        let envelope = Envelope::new(0, body)
            .scoped(to.transaction_id, Some(to.role_id))
            .with_cause(self.node.cause);
        self.node.core.export(self.node.hardware, &to.node, envelope)?;
        Ok(())
    }

    /// Suspend until a message matching `listen` arrives. Return the result
    /// from the procedure step.
    pub fn listen(&self, listen: Listen) -> Step {
        Step::Listen(listen)
    }
}
