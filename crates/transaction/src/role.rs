//! Roles: the procedures a node runs on behalf of a transaction.
//!
//! A role is a resumable state machine. The scheduler calls
//! [`Procedure::run`] once with [`Resume::Start`] and once more with
//! [`Resume::Message`] for every message that satisfies the [`Listen`] the
//! previous step returned. A step never blocks: waiting for a message is
//! expressed by returning [`Step::Listen`].
//!
//! A refused enlist is the one thing that wakes a role whatever it listens
//! for: it arrives as [`Resume::Rejected`] at the role's next receive point.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;

use corelib::{Body, NodeId, RoleId, TransactionId};

use crate::controller::{NodeContext, RoleController};
use crate::error::{Result, TransactionError};

/// The application running on a node: its private state and the procedures
/// its roles execute.
///
/// `Originator` and `Participant` are usually enums with one variant per
/// transaction kind, so adding a transaction kind is checked exhaustively.
pub trait Program: Sized + 'static {
    /// Node-private state. Only the running role may touch it.
    type State;

    /// Procedures a node starts on its own initiative.
    type Originator: Procedure<Self>;

    /// Procedures a node runs when another role enlists it. They travel inside
    /// start messages and spawned node configs, so they must serialize.
    type Participant: Procedure<Self> + Serialize + DeserializeOwned;

    /// Handle a message that is not scoped to any transaction.
    ///
    /// The default treats every such message as a protocol violation.
    fn on_message(_node: &mut NodeContext<'_, Self>, sender: NodeId, body: Body) -> Result<()> {
        Err(corelib::Error::ProtocolViolation(format!(
            "unexpected non-transactional message {:?} from {sender}",
            body.kind
        ))
        .into())
    }
}

/// One resumable procedure.
pub trait Procedure<P: Program> {
    fn run(&mut self, ctl: &mut RoleController<'_, P>, resume: Resume) -> Result<Step>;
}

/// Why a procedure is being run.
#[derive(Debug, Clone, PartialEq)]
pub enum Resume {
    /// First activation after the role left `Created`.
    Start,
    /// A message matching the last [`Listen`] arrived.
    Message(RoleMessage),
    /// `node` refused to host the participant `role_id` this role enlisted.
    /// Returning [`TransactionError::EnlistRejected`] fails the role.
    Rejected { node: NodeId, role_id: RoleId },
}

/// A role-scoped message as seen by the receiving role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleMessage {
    pub sender: NodeId,
    pub body: Body,
}

impl RoleMessage {
    pub fn is(&self, kind: &str) -> bool {
        self.body.is(kind)
    }
}

/// What a procedure wants after a step.
#[derive(Debug)]
pub enum Step {
    /// Suspend until a message satisfying the predicate arrives.
    Listen(Listen),
    Complete,
}

type Predicate = Box<dyn Fn(&RoleMessage) -> bool + Send>;

/// Receive predicate a suspended role waits on.
pub struct Listen {
    description: String,
    predicate: Predicate,
}

impl Listen {
    /// Match messages whose body has type `kind`.
    pub fn kind(kind: impl Into<String>) -> Self {
        let kind = kind.into();
        let wanted = kind.clone();
        Self {
            description: kind,
            predicate: Box::new(move |m| m.body.is(&wanted)),
        }
    }

    /// Match messages whose body has any of the given types.
    pub fn any_of<I, S>(kinds: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let kinds: Vec<String> = kinds.into_iter().map(Into::into).collect();
        Self {
            description: kinds.join("|"),
            predicate: Box::new(move |m| kinds.iter().any(|k| m.body.is(k))),
        }
    }

    /// Match every message.
    pub fn any() -> Self {
        Self {
            description: "*".to_string(),
            predicate: Box::new(|_| true),
        }
    }

    pub fn matching(description: impl Into<String>, predicate: impl Fn(&RoleMessage) -> bool + Send + 'static) -> Self {
        Self {
            description: description.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn matches(&self, message: &RoleMessage) -> bool {
        (self.predicate)(message)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Debug for Listen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listen").field(&self.description).finish()
    }
}

/// The two kinds of role.
pub enum Role<P: Program> {
    Originator(P::Originator),
    Participant(P::Participant),
}

impl<P: Program> Role<P> {
    pub fn kind(&self) -> RoleKind {
        match self {
            Role::Originator(_) => RoleKind::Originator,
            Role::Participant(_) => RoleKind::Participant,
        }
    }

    pub fn run(&mut self, ctl: &mut RoleController<'_, P>, resume: Resume) -> Result<Step> {
        match self {
            Role::Originator(procedure) => procedure.run(ctl, resume),
            Role::Participant(procedure) => procedure.run(ctl, resume),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleKind {
    Originator,
    Participant,
}

/// Observable lifecycle of a role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    /// Registered, waiting for its first scheduler turn.
    Created,
    /// Executing a step. Only lasts for the duration of the step, so observers
    /// outside the role never see it.
    Running,
    /// Waiting at a receive point.
    Suspended,
    Completed,
}

/// How a finished role ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed,
    Failed(String),
}

/// One finished role, as recorded by the node that ran it.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleRecord {
    pub transaction_id: TransactionId,
    pub role_id: RoleId,
    pub kind: RoleKind,
    pub outcome: Outcome,
    /// Node-local time of the first activation.
    pub started_at_ms: u64,
    pub completed_at_ms: u64,
}

impl RoleRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Completed
    }
}

impl From<&TransactionError> for Outcome {
    fn from(e: &TransactionError) -> Self {
        Outcome::Failed(e.to_string())
    }
}
