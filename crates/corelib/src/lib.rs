//! Core library shared by the messaging and transaction layers.
//!
//! This crate provides the value types every node speaks in:
//! - Node, transaction and role ids
//! - Handles and transports
//! - Envelopes and message bodies
//! - Timing configuration and tickers
//! - The error taxonomy and the hardware collaborator trait

pub mod config;
pub mod envelope;
pub mod error;
pub mod hardware;
pub mod ids;
pub mod network;
pub mod node;
pub mod ticker;

pub use config::{EnlistPolicy, GapPolicy, NodeSettings, TimingConfig};
pub use envelope::{Body, Envelope, EnvelopeId, RESERVED_FIELDS};
pub use error::{Error, HardwareError, Result};
pub use hardware::Hardware;
pub use ids::{IdGenerator, RoleId, TransactionId};
pub use network::{ControllerHandle, Handle, Identity, Transport};
pub use node::{ControllerId, NodeConfig, NodeId};
pub use ticker::Ticker;
