//! Per-node runtime: the event loop entry points and the single-role scheduler.
//!
//! A `NodeRuntime` owns one node's linker and private state and decides which
//! role runs. The hardware layer drives it through three calls:
//!
//! - [`NodeRuntime::receive`] for every inbound frame
//! - [`NodeRuntime::elapse`] when time advances
//! - [`NodeRuntime::run_ready`] to give scheduled roles their turn
//!
//! # Scheduling
//!
//! At most one role occupies the node's slot. A role enters the slot in
//! `Created` and its first activation is queued; it never runs inside the call
//! that created it. Roles arriving while the slot is taken wait in FIFO order
//! (or are refused under [`EnlistPolicy::Reject`]) and enter the slot when the
//! current role completes.
//!
//! # Obligations
//!
//! Every delivered envelope is held by the linker until the node releases it.
//! A start message is released after the role's first step, a role message
//! after the step it resumed, so anything those steps sent is attributed to
//! them and the acknowledgement cascades back to the original sender.

use std::collections::{HashSet, VecDeque};

use tracing::{debug, error, info, warn};

use corelib::{
    Body, ControllerId, EnlistPolicy, Envelope, EnvelopeId, Error, Handle, Hardware, IdGenerator, Identity,
    NodeConfig, NodeId, NodeSettings, RoleId, TransactionId,
};
use messaging::{codec, Delivery, Linker};

use crate::controller::{NodeContext, RoleController};
use crate::error::Result;
use crate::handle::RoleHandle;
use crate::protocol::{
    EnlistRejected, SpawnedParticipant, StartParticipantRole, ENLIST_REJECTED, START_PARTICIPANT_ROLE,
};
use crate::role::{Listen, Outcome, Program, Resume, Role, RoleKind, RoleMessage, RoleRecord, RoleState, Step};

/// The parts of a node that running code may borrow.
pub(crate) struct NodeCore<P: Program> {
    pub(crate) identity: Identity,
    pub(crate) settings: NodeSettings,
    pub(crate) ids: IdGenerator,
    pub(crate) linker: Linker,
    pub(crate) state: P::State,
}

impl<P: Program> NodeCore<P> {
    /// Export through the linker and hand the resulting frames to the hardware.
    pub(crate) fn export(&mut self, hardware: &mut dyn Hardware, receiver: &Handle, envelope: Envelope) -> Result<u64> {
        if !hardware.is_reachable(self.identity.node, receiver) {
            return Err(Error::UnreachablePeer {
                sender: self.identity.node,
                receiver: receiver.id,
            }
            .into());
        }
        let sequence_number = self.linker.export(receiver, envelope)?;
        self.flush(hardware);
        Ok(sequence_number)
    }

    /// Transmit everything in the linker's outbox.
    ///
    /// A failed send counts as loss: the exporter retransmits it later.
    pub(crate) fn flush(&mut self, hardware: &mut dyn Hardware) {
        for outgoing in self.linker.drain_outbox() {
            let payload = match codec::encode(&outgoing.packet()) {
                Ok(payload) => payload,
                Err(e) => {
                    error!(node = %self.identity.node, error = %e, "failed to encode frame");
                    continue;
                }
            };
            if let Err(e) = hardware.send(self.identity.node, &outgoing.receiver, payload) {
                warn!(
                    node = %self.identity.node,
                    receiver = %outgoing.receiver.id,
                    error = %e,
                    "frame was not transmitted"
                );
            }
        }
    }
}

/// Counters kept by a node runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub roles_started: u64,
    pub roles_completed: u64,
    pub roles_failed: u64,
    /// Roles that had to wait for the slot.
    pub roles_queued: u64,
    pub enlists_rejected: u64,
    /// Envelopes that named no known role, or could not be decoded.
    pub protocol_violations: u64,
}

struct Inbox {
    resume: Resume,
    cause: EnvelopeId,
}

/// Type of the message behind `resume`, for logs.
fn kind_of(resume: &Resume) -> &str {
    match resume {
        Resume::Start => START_PARTICIPANT_ROLE,
        Resume::Message(message) => &message.body.kind,
        Resume::Rejected { .. } => ENLIST_REJECTED,
    }
}

/// Whether `resume` ends a wait on `listen`. Rejections always do.
fn wakes(listen: &Listen, resume: &Resume) -> bool {
    match resume {
        Resume::Message(message) => listen.matches(message),
        Resume::Start | Resume::Rejected { .. } => true,
    }
}

struct Slot<P: Program> {
    role: Role<P>,
    transaction_id: TransactionId,
    role_id: RoleId,
    state: RoleState,
    /// Set while suspended and no matching message has been scheduled yet.
    listen: Option<Listen>,
    enlister: Option<RoleHandle>,
    /// Start message, held until the first step is over.
    start_cause: Option<EnvelopeId>,
    /// Messages that arrived while the role was not waiting for them.
    mailbox: VecDeque<Inbox>,
    started_at_ms: Option<u64>,
}

enum Activation {
    Start {
        role_id: RoleId,
    },
    Resume {
        role_id: RoleId,
        resume: Resume,
        cause: EnvelopeId,
    },
}

impl Activation {
    fn role_id(&self) -> RoleId {
        match self {
            Activation::Start { role_id } | Activation::Resume { role_id, .. } => *role_id,
        }
    }
}

enum Admission {
    Activated,
    Queued,
    Duplicate,
    Rejected,
}

pub struct NodeRuntime<P: Program> {
    core: NodeCore<P>,
    active: Option<Slot<P>>,
    waiting: VecDeque<Slot<P>>,
    ready: VecDeque<Activation>,
    /// Every role id this node ever admitted.
    known_roles: HashSet<RoleId>,
    history: Vec<RoleRecord>,
    stats: RuntimeStats,
}

impl<P: Program> NodeRuntime<P> {
    /// Bring up a node from its config.
    ///
    /// When the config carries a spawned participant record, that participant
    /// is admitted immediately and runs on the first [`NodeRuntime::run_ready`].
    pub fn new(config: NodeConfig, controller_id: ControllerId, state: P::State) -> Result<Self> {
        let identity = Identity::new(config.id, controller_id, config.secret);
        let mut runtime = Self {
            core: NodeCore {
                identity,
                settings: config.settings,
                ids: IdGenerator::new(config.id),
                linker: Linker::new(identity, config.settings),
                state,
            },
            active: None,
            waiting: VecDeque::new(),
            ready: VecDeque::new(),
            known_roles: HashSet::new(),
            history: Vec::new(),
            stats: RuntimeStats::default(),
        };

        if let Some(record) = config.start_participant_role {
            let spawned: SpawnedParticipant<P::Participant> =
                serde_json::from_value(record).map_err(Error::from)?;
            runtime.admit(
                spawned.transaction_id,
                spawned.role_id,
                Role::Participant(spawned.participant),
                Some(spawned.enlister),
                None,
            );
        }
        Ok(runtime)
    }

    pub fn id(&self) -> NodeId {
        self.core.identity.node
    }

    pub fn now_ms(&self) -> u64 {
        self.core.linker.now_ms()
    }

    /// A handle `for_node` can use to reach this node.
    pub fn new_handle(&self, for_node: NodeId) -> Handle {
        self.core.identity.new_handle(for_node)
    }

    pub fn state(&self) -> &P::State {
        &self.core.state
    }

    pub fn state_mut(&mut self) -> &mut P::State {
        &mut self.core.state
    }

    pub fn linker(&self) -> &Linker {
        &self.core.linker
    }

    pub fn stats(&self) -> RuntimeStats {
        self.stats
    }

    /// Finished roles in completion order.
    pub fn history(&self) -> &[RoleRecord] {
        &self.history
    }

    /// The transaction and lifecycle state of the role in the slot: `Created`
    /// before its first step, `Suspended` between steps.
    pub fn active_role(&self) -> Option<(TransactionId, RoleId, RoleState)> {
        self.active
            .as_ref()
            .map(|slot| (slot.transaction_id, slot.role_id, slot.state))
    }

    pub fn waiting_roles(&self) -> usize {
        self.waiting.len()
    }

    /// No role is running, suspended or waiting.
    pub fn is_idle(&self) -> bool {
        self.active.is_none() && self.waiting.is_empty() && self.ready.is_empty()
    }

    /// Idle, with nothing left to send or acknowledge.
    pub fn is_quiescent(&self) -> bool {
        self.is_idle() && self.core.linker.is_quiescent()
    }

    /// Create a transaction and queue `originator` as its first role.
    pub fn start_transaction(&mut self, originator: P::Originator) -> TransactionId {
        let transaction_id = self.core.ids.transaction_id();
        self.admit_originator(transaction_id, originator);
        transaction_id
    }

    /// Handle one encoded frame from `sender`.
    ///
    /// # Errors
    /// `ProtocolViolation` or `Codec` when the frame is refused. The frame is
    /// dropped and the node's state is unchanged. Envelopes that decode but
    /// name no known role are logged and counted rather than returned.
    pub fn receive(&mut self, hardware: &mut dyn Hardware, sender: NodeId, payload: &[u8]) -> Result<()> {
        let deliveries = codec::decode(payload).and_then(|packet| self.core.linker.receive(sender, packet));
        let deliveries = match deliveries {
            Ok(deliveries) => deliveries,
            Err(e) => {
                self.stats.protocol_violations += 1;
                error!(node = %self.id(), %sender, error = %e, "dropping frame");
                return Err(e.into());
            }
        };
        for delivery in deliveries {
            self.dispatch(hardware, delivery);
        }
        self.core.flush(hardware);
        Ok(())
    }

    /// Advance the node's clock by `ms`.
    pub fn elapse(&mut self, hardware: &mut dyn Hardware, ms: u64) {
        self.core.linker.elapse(ms);
        self.core.flush(hardware);
    }

    /// Run the activations that were scheduled before this call.
    ///
    /// Activations scheduled while these run wait for the next call. Returns
    /// the number of activations run.
    pub fn run_ready(&mut self, hardware: &mut dyn Hardware) -> usize {
        let turns = self.ready.len();
        for _ in 0..turns {
            let Some(activation) = self.ready.pop_front() else {
                break;
            };
            self.activate(hardware, activation);
        }
        self.core.flush(hardware);
        turns
    }

    fn dispatch(&mut self, hardware: &mut dyn Hardware, delivery: Delivery) {
        let Delivery { id, envelope } = delivery;
        let Envelope {
            transaction_id,
            role_id,
            body,
            ..
        } = envelope;

        let kept = match transaction_id {
            None => self.dispatch_node_message(hardware, id, body),
            Some(tx) if body.is(START_PARTICIPANT_ROLE) => self.dispatch_start(hardware, id, tx, role_id, body),
            Some(tx) => self.dispatch_role_message(id, tx, role_id, body),
        };
        match kept {
            Ok(true) => {}
            Ok(false) => self.release(id),
            Err(e) => {
                self.stats.protocol_violations += 1;
                error!(node = %self.id(), envelope = %id, error = %e, "dropping envelope");
                self.release(id);
            }
        }
    }

    /// Returns whether the envelope's hold was handed on to a role.
    fn dispatch_node_message(&mut self, hardware: &mut dyn Hardware, id: EnvelopeId, body: Body) -> Result<bool> {
        let mut started = Vec::new();
        let result = {
            let mut ctx = NodeContext::new(&mut self.core, hardware, Some(id), &mut started);
            P::on_message(&mut ctx, id.sender, body)
        };
        for (transaction_id, originator) in started {
            self.admit_originator(transaction_id, originator);
        }
        result.map(|()| false)
    }

    fn dispatch_start(
        &mut self,
        hardware: &mut dyn Hardware,
        id: EnvelopeId,
        transaction_id: TransactionId,
        role_id: Option<RoleId>,
        body: Body,
    ) -> Result<bool> {
        let role_id = role_id
            .ok_or_else(|| Error::ProtocolViolation(format!("start message {id} carries no role id")))?;
        let start: StartParticipantRole<P::Participant> = body.to_record()?;
        let enlister = start.enlister.clone();

        match self.admit(
            transaction_id,
            role_id,
            Role::Participant(start.participant),
            Some(start.enlister),
            Some(id),
        ) {
            Admission::Activated | Admission::Queued => Ok(true),
            Admission::Duplicate => {
                debug!(node = %self.id(), role_id = %role_id, "ignoring a second start for a known role");
                Ok(false)
            }
            Admission::Rejected => {
                let body = Body::from_record(ENLIST_REJECTED, &EnlistRejected { rejected_role_id: role_id })?;
                let envelope = Envelope::new(0, body)
                    .scoped(enlister.transaction_id, Some(enlister.role_id))
                    .with_cause(Some(id));
                self.core.export(hardware, &enlister.node, envelope)?;
                Ok(false)
            }
        }
    }

    fn dispatch_role_message(
        &mut self,
        id: EnvelopeId,
        transaction_id: TransactionId,
        role_id: Option<RoleId>,
        body: Body,
    ) -> Result<bool> {
        let role_id = role_id.ok_or_else(|| {
            Error::ProtocolViolation(format!("transaction message {id} for {transaction_id} carries no role id"))
        })?;
        let resume = if body.is(ENLIST_REJECTED) {
            let rejected: EnlistRejected = body.to_record()?;
            Resume::Rejected {
                node: id.sender,
                role_id: rejected.rejected_role_id,
            }
        } else {
            Resume::Message(RoleMessage {
                sender: id.sender,
                body,
            })
        };
        let addressed = |slot: &Slot<P>| slot.role_id == role_id && slot.transaction_id == transaction_id;

        if let Some(slot) = self.active.as_mut().filter(|slot| addressed(slot)) {
            if slot.listen.as_ref().is_some_and(|listen| wakes(listen, &resume)) {
                slot.listen = None;
                self.ready.push_back(Activation::Resume {
                    role_id,
                    resume,
                    cause: id,
                });
            } else {
                slot.mailbox.push_back(Inbox { resume, cause: id });
            }
            return Ok(true);
        }

        if let Some(slot) = self.waiting.iter_mut().find(|slot| addressed(slot)) {
            slot.mailbox.push_back(Inbox { resume, cause: id });
            return Ok(true);
        }

        if self.known_roles.contains(&role_id) {
            warn!(
                node = %self.id(),
                transaction_id = %transaction_id,
                role_id = %role_id,
                kind = kind_of(&resume),
                "dropping a message for a completed role"
            );
            return Ok(false);
        }

        Err(Error::ProtocolViolation(format!(
            "no role {role_id} of transaction {transaction_id} on this node"
        ))
        .into())
    }

    fn admit_originator(&mut self, transaction_id: TransactionId, originator: P::Originator) {
        let role_id = self.core.ids.role_id();
        self.admit(transaction_id, role_id, Role::Originator(originator), None, None);
    }

    fn admit(
        &mut self,
        transaction_id: TransactionId,
        role_id: RoleId,
        role: Role<P>,
        enlister: Option<RoleHandle>,
        start_cause: Option<EnvelopeId>,
    ) -> Admission {
        if !self.known_roles.insert(role_id) {
            return Admission::Duplicate;
        }
        let kind = role.kind();
        let slot = Slot {
            role,
            transaction_id,
            role_id,
            state: RoleState::Created,
            listen: None,
            enlister,
            start_cause,
            mailbox: VecDeque::new(),
            started_at_ms: None,
        };

        let Some(active) = &self.active else {
            info!(node = %self.id(), transaction_id = %transaction_id, role_id = %role_id, ?kind, "role created");
            self.occupy(slot);
            return Admission::Activated;
        };

        if kind == RoleKind::Participant
            && self.core.settings.enlist_policy == EnlistPolicy::Reject
            && active.transaction_id != transaction_id
        {
            warn!(
                node = %self.id(),
                transaction_id = %transaction_id,
                busy_with = %active.transaction_id,
                "rejecting enlist: node is busy"
            );
            self.known_roles.remove(&role_id);
            self.stats.enlists_rejected += 1;
            metrics::counter!("transaction_enlists_rejected_total").increment(1);
            return Admission::Rejected;
        }

        info!(
            node = %self.id(),
            transaction_id = %transaction_id,
            role_id = %role_id,
            busy_with = %active.transaction_id,
            ?kind,
            "role queued until the node is free"
        );
        self.stats.roles_queued += 1;
        self.waiting.push_back(slot);
        Admission::Queued
    }

    /// Put `slot` in the node's slot and schedule its first activation.
    fn occupy(&mut self, slot: Slot<P>) {
        self.ready.push_back(Activation::Start { role_id: slot.role_id });
        self.active = Some(slot);
    }

    fn activate(&mut self, hardware: &mut dyn Hardware, activation: Activation) {
        let Some(mut slot) = self.active.take() else {
            error!(node = %self.id(), "activation scheduled with no role in the slot");
            return;
        };
        if slot.role_id != activation.role_id() {
            error!(
                node = %self.id(),
                role_id = %slot.role_id,
                "activation does not belong to the role in the slot"
            );
            self.active = Some(slot);
            return;
        }

        let (resume, cause) = match activation {
            Activation::Start { .. } => (Resume::Start, slot.start_cause.take()),
            Activation::Resume { resume, cause, .. } => (resume, Some(cause)),
        };
        if slot.started_at_ms.is_none() {
            slot.started_at_ms = Some(self.now_ms());
            self.stats.roles_started += 1;
        }
        slot.state = RoleState::Running;
        debug!(node = %self.id(), transaction_id = %slot.transaction_id, role_id = %slot.role_id, "role running");

        let mut started = Vec::new();
        let result = {
            let ctx = NodeContext::new(&mut self.core, hardware, cause, &mut started);
            let mut ctl = RoleController::new(ctx, slot.transaction_id, slot.role_id, slot.enlister.clone());
            slot.role.run(&mut ctl, resume)
        };
        if let Some(cause) = cause {
            self.release(cause);
        }

        match result {
            Ok(Step::Listen(listen)) => {
                slot.state = RoleState::Suspended;
                debug!(
                    node = %self.id(),
                    role_id = %slot.role_id,
                    listen = listen.description(),
                    "role suspended"
                );
                let queued = slot.mailbox.iter().position(|inbox| wakes(&listen, &inbox.resume));
                match queued.and_then(|i| slot.mailbox.remove(i)) {
                    Some(inbox) => self.ready.push_back(Activation::Resume {
                        role_id: slot.role_id,
                        resume: inbox.resume,
                        cause: inbox.cause,
                    }),
                    None => slot.listen = Some(listen),
                }
                self.active = Some(slot);
            }
            Ok(Step::Complete) => self.finish(slot, Outcome::Completed),
            Err(e) => {
                error!(
                    node = %self.id(),
                    transaction_id = %slot.transaction_id,
                    role_id = %slot.role_id,
                    error = %e,
                    "role failed"
                );
                self.finish(slot, Outcome::from(&e));
            }
        }

        for (transaction_id, originator) in started {
            self.admit_originator(transaction_id, originator);
        }
    }

    /// Retire a finished role and hand the slot to the next waiting one.
    fn finish(&mut self, mut slot: Slot<P>, outcome: Outcome) {
        slot.state = RoleState::Completed;
        for inbox in std::mem::take(&mut slot.mailbox) {
            warn!(
                node = %self.id(),
                role_id = %slot.role_id,
                kind = kind_of(&inbox.resume),
                "role completed without consuming a message"
            );
            self.release(inbox.cause);
        }

        match outcome {
            Outcome::Completed => {
                self.stats.roles_completed += 1;
                metrics::counter!("transaction_roles_completed_total").increment(1);
            }
            Outcome::Failed(_) => {
                self.stats.roles_failed += 1;
                metrics::counter!("transaction_roles_failed_total").increment(1);
            }
        }
        let now = self.now_ms();
        let record = RoleRecord {
            transaction_id: slot.transaction_id,
            role_id: slot.role_id,
            kind: slot.role.kind(),
            outcome,
            started_at_ms: slot.started_at_ms.unwrap_or(now),
            completed_at_ms: now,
        };
        info!(
            node = %self.id(),
            transaction_id = %record.transaction_id,
            role_id = %record.role_id,
            outcome = ?record.outcome,
            "role completed"
        );
        self.history.push(record);

        if let Some(next) = self.waiting.pop_front() {
            self.occupy(next);
        }
    }

    fn release(&mut self, id: EnvelopeId) {
        if let Err(e) = self.core.linker.release(id) {
            error!(node = %self.id(), envelope = %id, error = %e, "failed to release envelope");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use corelib::HardwareError;
    use messaging::Frame;
    use crate::error::TransactionError;
    use crate::role::Procedure;
    use serde::{Deserialize, Serialize};

    /// Records transmitted frames instead of delivering them.
    #[derive(Default)]
    struct Recorder {
        sent: Vec<(NodeId, Handle, Frame)>,
        spawned: Vec<NodeConfig>,
    }

    impl Hardware for Recorder {
        fn controller_id(&self) -> ControllerId {
            ControllerId(1)
        }

        fn is_reachable(&self, sender: NodeId, receiver: &Handle) -> bool {
            receiver.usable_by(sender)
        }

        fn send(&mut self, sender: NodeId, receiver: &Handle, payload: Bytes) -> std::result::Result<(), HardwareError> {
            let packet = codec::decode(&payload).map_err(|_| HardwareError::NoNodeForId(receiver.id))?;
            self.sent.push((sender, receiver.clone(), packet.frame));
            Ok(())
        }

        fn spawn_node(&mut self, config: NodeConfig) -> std::result::Result<ControllerId, HardwareError> {
            self.spawned.push(config);
            Ok(ControllerId(1))
        }

        fn terminate_node(&mut self, _node: NodeId) -> std::result::Result<(), HardwareError> {
            Ok(())
        }
    }

    impl Recorder {
        fn kinds(&self) -> Vec<String> {
            self.sent
                .iter()
                .filter_map(|(_, _, frame)| match frame {
                    Frame::Sequenced { envelope, .. } => Some(envelope.body.kind.clone()),
                    Frame::Acknowledge { .. } => None,
                })
                .collect()
        }
    }

    /// Participants wait for one "go" message, then complete.
    struct Waiter;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct WaitForGo;

    impl Program for Waiter {
        type State = Vec<&'static str>;
        type Originator = Noop;
        type Participant = WaitForGo;
    }

    struct Noop;

    impl Procedure<Waiter> for Noop {
        fn run(&mut self, ctl: &mut RoleController<'_, Waiter>, _resume: Resume) -> Result<Step> {
            ctl.state().push("originator");
            Ok(Step::Complete)
        }
    }

    impl Procedure<Waiter> for WaitForGo {
        fn run(&mut self, ctl: &mut RoleController<'_, Waiter>, resume: Resume) -> Result<Step> {
            match resume {
                Resume::Start => {
                    ctl.state().push("started");
                    Ok(ctl.listen(Listen::kind("go")))
                }
                Resume::Message(_) => {
                    ctl.state().push("went");
                    Ok(Step::Complete)
                }
                Resume::Rejected { node, .. } => {
                    ctl.state().push("rejected");
                    Err(TransactionError::EnlistRejected { node })
                }
            }
        }
    }

    const HOST: NodeId = NodeId(10);
    const PEER: NodeId = NodeId(20);

    fn host(policy: EnlistPolicy) -> NodeRuntime<Waiter> {
        let settings = NodeSettings {
            enlist_policy: policy,
            ..NodeSettings::default()
        };
        NodeRuntime::new(NodeConfig::new(HOST, 11).with_settings(settings), ControllerId(1), Vec::new()).unwrap()
    }

    /// A peer-side encoder of frames addressed to the host.
    struct Peer {
        identity: Identity,
        linker: Linker,
        host: Handle,
    }

    impl Peer {
        fn new(host: &NodeRuntime<Waiter>) -> Self {
            let identity = Identity::new(PEER, ControllerId(1), 21);
            Self {
                identity,
                linker: Linker::new(identity, NodeSettings::default()),
                host: host.new_handle(PEER),
            }
        }

        fn enlister(&self, transaction_id: TransactionId) -> RoleHandle {
            RoleHandle {
                node: self.identity.new_handle(HOST),
                transaction_id,
                role_id: RoleId(900),
            }
        }

        fn frames(&mut self, envelope: Envelope) -> Vec<Bytes> {
            self.linker.export(&self.host, envelope).unwrap();
            self.linker
                .drain_outbox()
                .iter()
                .map(|o| codec::encode(&o.packet()).unwrap())
                .collect()
        }

        fn start(&mut self, transaction_id: TransactionId, role_id: RoleId) -> Bytes {
            let record = StartParticipantRole {
                participant: WaitForGo,
                enlister: self.enlister(transaction_id),
            };
            let body = Body::from_record(START_PARTICIPANT_ROLE, &record).unwrap();
            self.frames(Envelope::new(0, body).scoped(transaction_id, Some(role_id)))
                .remove(0)
        }

        fn rejected(&mut self, transaction_id: TransactionId, role_id: RoleId) -> Bytes {
            let record = EnlistRejected {
                rejected_role_id: RoleId(901),
            };
            let body = Body::from_record(ENLIST_REJECTED, &record).unwrap();
            self.frames(Envelope::new(0, body).scoped(transaction_id, Some(role_id)))
                .remove(0)
        }

        fn go(&mut self, transaction_id: TransactionId, role_id: RoleId) -> Bytes {
            self.frames(Envelope::new(0, Body::new("go")).scoped(transaction_id, Some(role_id)))
                .remove(0)
        }
    }

    #[test]
    fn test_role_runs_on_a_later_turn_not_inline() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let tx = node.start_transaction(Noop);

        assert!(node.state().is_empty());
        assert_eq!(node.active_role().map(|(t, _, s)| (t, s)), Some((tx, RoleState::Created)));

        assert_eq!(node.run_ready(&mut hw), 1);
        assert_eq!(node.state(), &vec!["originator"]);
        assert!(node.is_idle());
        assert!(node.history()[0].succeeded());
    }

    #[test]
    fn test_enlist_for_other_transaction_is_queued() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.run_ready(&mut hw);
        assert_eq!(node.active_role().map(|(_, _, s)| s), Some(RoleState::Suspended));

        node.receive(&mut hw, PEER, &peer.start(TransactionId(2), RoleId(2))).unwrap();
        node.run_ready(&mut hw);
        assert_eq!(node.waiting_roles(), 1);
        assert_eq!(node.state(), &vec!["started"]);

        node.receive(&mut hw, PEER, &peer.go(TransactionId(1), RoleId(1))).unwrap();
        node.run_ready(&mut hw);
        assert_eq!(node.state(), &vec!["started", "went"]);
        // The queued role got the slot but has not run yet.
        assert_eq!(
            node.active_role().map(|(t, _, s)| (t, s)),
            Some((TransactionId(2), RoleState::Created))
        );

        node.run_ready(&mut hw);
        assert_eq!(node.state(), &vec!["started", "went", "started"]);
        assert_eq!(node.stats().roles_queued, 1);
    }

    #[test]
    fn test_enlist_rejected_when_busy_under_reject_policy() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Reject);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.run_ready(&mut hw);
        node.receive(&mut hw, PEER, &peer.start(TransactionId(2), RoleId(2))).unwrap();

        assert_eq!(node.waiting_roles(), 0);
        assert_eq!(node.stats().enlists_rejected, 1);
        assert_eq!(hw.kinds(), vec![ENLIST_REJECTED.to_string()]);
    }

    #[test]
    fn test_rejection_wakes_a_role_listening_for_something_else() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.run_ready(&mut hw);
        node.receive(&mut hw, PEER, &peer.rejected(TransactionId(1), RoleId(1))).unwrap();
        assert_eq!(node.run_ready(&mut hw), 1);

        assert_eq!(node.state(), &vec!["started", "rejected"]);
        assert!(node.is_idle());
        let record = &node.history()[0];
        assert!(matches!(&record.outcome, Outcome::Failed(reason) if reason.contains("rejected")));
    }

    #[test]
    fn test_running_state_never_escapes_a_step() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);
        let mut seen = vec![node.active_role().map(|(_, _, s)| s)];

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        seen.push(node.active_role().map(|(_, _, s)| s));
        node.run_ready(&mut hw);
        seen.push(node.active_role().map(|(_, _, s)| s));
        node.receive(&mut hw, PEER, &peer.go(TransactionId(1), RoleId(1))).unwrap();
        seen.push(node.active_role().map(|(_, _, s)| s));
        node.run_ready(&mut hw);
        seen.push(node.active_role().map(|(_, _, s)| s));

        assert_eq!(
            seen,
            vec![
                None,
                Some(RoleState::Created),
                Some(RoleState::Suspended),
                Some(RoleState::Suspended),
                None,
            ]
        );
    }

    #[test]
    fn test_second_start_for_same_role_is_ignored() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.run_ready(&mut hw);

        assert_eq!(node.state(), &vec!["started"]);
        assert_eq!(node.waiting_roles(), 0);
    }

    #[test]
    fn test_message_for_unknown_role_is_counted_and_released() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.go(TransactionId(7), RoleId(7))).unwrap();
        assert_eq!(node.stats().protocol_violations, 1);

        // Released, so the next acknowledgement round covers it.
        node.elapse(&mut hw, 30);
        assert!(hw
            .sent
            .iter()
            .any(|(_, _, f)| matches!(f, Frame::Acknowledge { sequence_number: 0 })));
    }

    #[test]
    fn test_start_message_held_until_first_step() {
        let mut hw = Recorder::default();
        let mut node = host(EnlistPolicy::Queue);
        let mut peer = Peer::new(&node);

        node.receive(&mut hw, PEER, &peer.start(TransactionId(1), RoleId(1))).unwrap();
        node.elapse(&mut hw, 30);
        assert!(hw.sent.is_empty());

        node.run_ready(&mut hw);
        node.elapse(&mut hw, 30);
        assert_eq!(hw.sent.len(), 1);
    }

    #[test]
    fn test_spawned_config_starts_participant() {
        let mut hw = Recorder::default();
        let enlister = RoleHandle {
            node: Identity::new(PEER, ControllerId(1), 21).new_handle(HOST),
            transaction_id: TransactionId(3),
            role_id: RoleId(30),
        };
        let mut config = NodeConfig::new(HOST, 11);
        config.start_participant_role = Some(
            serde_json::to_value(SpawnedParticipant {
                transaction_id: TransactionId(3),
                role_id: RoleId(31),
                participant: WaitForGo,
                enlister,
            })
            .unwrap(),
        );
        let mut node: NodeRuntime<Waiter> = NodeRuntime::new(config, ControllerId(1), Vec::new()).unwrap();
        node.run_ready(&mut hw);
        assert_eq!(node.state(), &vec!["started"]);
        assert_eq!(
            node.active_role().map(|(t, r, _)| (t, r)),
            Some((TransactionId(3), RoleId(31)))
        );
    }
}
