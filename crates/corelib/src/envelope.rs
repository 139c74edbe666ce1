//! Envelopes: the minimal message unit carrying a sequence number and a body.
//!
//! Wire shape: `{sequence_number, transaction_id?, role_id?, type, ...body fields}`.
//! Only the fields needed for delivery bookkeeping are typed; the rest of the
//! body is an open JSON record owned by the application.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::ids::{RoleId, TransactionId};
use crate::node::NodeId;

/// A structured message body: a `type` tag plus arbitrary named fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Body {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Keys the envelope itself puts on the wire. A body field with one of these
/// names would be encoded twice and the frame could never be decoded.
pub const RESERVED_FIELDS: [&str; 4] = ["sequence_number", "transaction_id", "role_id", "type"];

fn reserved(key: &str) -> Result<()> {
    if RESERVED_FIELDS.contains(&key) {
        return Err(Error::ProtocolViolation(format!("`{key}` is reserved for the envelope")));
    }
    Ok(())
}

impl Body {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Map::new(),
        }
    }

    /// Add a field.
    ///
    /// # Errors
    /// `ProtocolViolation` for a reserved key, `Codec` when `value` does not
    /// serialize.
    pub fn with(mut self, key: impl Into<String>, value: impl Serialize) -> Result<Self> {
        let key = key.into();
        reserved(&key)?;
        self.fields.insert(key, serde_json::to_value(value)?);
        Ok(self)
    }

    /// Build a body whose fields are the serialized form of `record`.
    ///
    /// `record` must serialize to a JSON object without reserved keys.
    pub fn from_record(kind: impl Into<String>, record: &impl Serialize) -> Result<Self> {
        match serde_json::to_value(record)? {
            Value::Object(fields) => {
                let body = Self {
                    kind: kind.into(),
                    fields,
                };
                body.validate()?;
                Ok(body)
            }
            other => Err(Error::ProtocolViolation(format!(
                "body record must be an object, got {other}"
            ))),
        }
    }

    /// Check that no field collides with the envelope's own keys.
    pub fn validate(&self) -> Result<()> {
        self.fields.keys().try_for_each(|key| reserved(key))
    }

    /// Decode all fields into a typed record.
    pub fn to_record<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    /// Decode a single field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let value = self
            .fields
            .get(key)
            .ok_or_else(|| Error::ProtocolViolation(format!("missing field `{key}` in `{}`", self.kind)))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn is(&self, kind: &str) -> bool {
        self.kind == kind
    }
}

/// Identifies an inbound envelope: the sender and the sender's sequence number.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EnvelopeId {
    pub sender: NodeId,
    pub sequence_number: u64,
}

impl std::fmt::Display for EnvelopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.sender, self.sequence_number)
    }
}

/// A sequenced message between one sender and one receiver.
///
/// Sequence numbers are per (sender, receiver) pair, start at 0 and increase by
/// one per fresh export; a retransmission reuses the original number.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub sequence_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_id: Option<TransactionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_id: Option<RoleId>,
    #[serde(flatten)]
    pub body: Body,
    /// The inbound envelope whose processing produced this one.
    ///
    /// Local bookkeeping of the sending node; never put on the wire.
    #[serde(skip)]
    pub caused_by: Option<EnvelopeId>,
}

impl Envelope {
    pub fn new(sequence_number: u64, body: Body) -> Self {
        Self {
            sequence_number,
            transaction_id: None,
            role_id: None,
            body,
            caused_by: None,
        }
    }

    pub fn scoped(mut self, transaction_id: TransactionId, role_id: Option<RoleId>) -> Self {
        self.transaction_id = Some(transaction_id);
        self.role_id = role_id;
        self
    }

    pub fn with_cause(mut self, cause: Option<EnvelopeId>) -> Self {
        self.caused_by = cause;
        self
    }
}
