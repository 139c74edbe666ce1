//! Frames exchanged between a node's exporters and its peers' importers.
//!
//! Two kinds of frame travel on every sender/receiver pair: sequenced frames
//! carrying an envelope, and cumulative acknowledgements flowing back. Every
//! frame travels inside a [`Packet`] together with the transport that
//! authorizes it, so the receiver can check the sender was given a handle.

use serde::{Deserialize, Serialize};

use corelib::{Envelope, Handle, Transport};

/// One unit on the wire.
///
/// Encoded adjacently tagged:
/// `{"channel": "sequenced", "value": {"reply": ..., "envelope": ...}}` or
/// `{"channel": "acknowledge", "value": {"sequence_number": N}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "channel", content = "value", rename_all = "snake_case")]
pub enum Frame {
    /// A sequenced envelope. `reply` is a handle the receiver can use to send
    /// acknowledgements back to the sender.
    Sequenced { reply: Handle, envelope: Envelope },
    /// Acknowledges every envelope with sequence number <= `sequence_number`.
    Acknowledge { sequence_number: u64 },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Sequenced { .. } => "sequenced",
            Frame::Acknowledge { .. } => "acknowledge",
        }
    }
}

/// What the hardware layer moves: `{"transport": ..., "frame": ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Transport of the handle the sender used.
    pub transport: Transport,
    pub frame: Frame,
}

/// A frame waiting to be handed to the hardware layer.
#[derive(Clone, Debug, PartialEq)]
pub struct Outgoing {
    pub receiver: Handle,
    pub frame: Frame,
}

impl Outgoing {
    /// The packet to transmit to `receiver`.
    pub fn packet(&self) -> Packet {
        Packet {
            transport: self.receiver.transport.clone(),
            frame: self.frame.clone(),
        }
    }
}
