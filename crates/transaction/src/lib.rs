//! Distributed transactions over reliable node-to-node messaging.
//!
//! A transaction is the set of roles that cooperate on one distributed state
//! change. Each role is a resumable procedure run by exactly one node:
//! - `role`: the `Program` and `Procedure` traits, `Listen`, role lifecycle
//! - `controller`: the capabilities a running role uses (`enlist`,
//!   `spawn_enlist`, `send`, `listen`)
//! - `node`: the per-node runtime that guarantees at most one running role
//! - `simulator`: a deterministic network for driving many nodes in tests
//!
//! There is no shared state between nodes; every guarantee rests on the
//! messaging layer's exactly-once, per-link ordered delivery.

pub mod controller;
pub mod error;
pub mod handle;
pub mod node;
pub mod protocol;
pub mod role;
pub mod simulator;

pub use controller::{NodeContext, RoleController};
pub use error::{Result, TransactionError};
pub use handle::RoleHandle;
pub use node::{NodeRuntime, RuntimeStats};
pub use role::{
    Listen, Outcome, Procedure, Program, Resume, Role, RoleKind, RoleMessage, RoleRecord, RoleState, Step,
};
pub use simulator::{NetworkStats, SimulatedNetwork, Simulation, SimulationConfig};
