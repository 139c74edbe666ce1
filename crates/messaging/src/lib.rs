//! Reliable, causally gated message delivery between nodes.
//!
//! This crate turns an unreliable transport (loss, duplication, delay) into
//! per-pair channels with exactly-once effective delivery:
//! - `Importer`: per-sender deduplication and acknowledgement gating
//! - `Exporter`: per-receiver sequencing, retention and retransmission
//! - `Linker`: one per node; owns both sides and cascades acknowledgements
//!   along causal links
//! - `Frame`, `Packet` and the codec: what actually travels between nodes

pub mod codec;
pub mod exporter;
pub mod importer;
pub mod linker;
pub mod protocol;

pub use exporter::Exporter;
pub use importer::{Importer, Receipt};
pub use linker::{Delivery, Linker, LinkerStats};
pub use protocol::{Frame, Outgoing, Packet};
