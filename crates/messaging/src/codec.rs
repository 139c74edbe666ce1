//! JSON codec between packets and the raw bytes the hardware layer moves.

use bytes::Bytes;

use corelib::Result;

use crate::protocol::Packet;

pub fn encode(packet: &Packet) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(packet)?))
}

/// Decode one packet. Malformed input is a `Codec` error, which callers treat
/// as a protocol violation.
pub fn decode(bytes: &[u8]) -> Result<Packet> {
    Ok(serde_json::from_slice(bytes)?)
}
