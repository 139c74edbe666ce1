//! Node identity and the configuration record used to create nodes.
//!
//! Nodes are the addressable endpoints of all messaging. They are identified by
//! a compact `NodeId` that is cheap to compare and hash; everything a node needs
//! at creation time travels in a `NodeConfig`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::NodeSettings;

/// Declares a `u128` newtype id with hex display and string serialization.
///
/// Ids travel inside JSON envelopes as 32-character hex strings rather than
/// numbers so they survive any intermediate representation unchanged.
macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
        #[serde(into = "String", try_from = "String")]
        pub struct $name(pub u128);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:032x}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                u128::from_str_radix(s, 16).map($name)
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> String {
                id.to_string()
            }
        }

        impl TryFrom<String> for $name {
            type Error = std::num::ParseIntError;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

pub(crate) use define_id;

define_id!(
    /// Compact identifier for a node.
    ///
    /// Newtype over `u128` so comparisons and hashing are very fast while giving
    /// plenty of space for uniqueness.
    NodeId
);

define_id!(
    /// Identifier of the machine controller hosting a node.
    ControllerId
);

/// Everything needed to bring a new node to life.
///
/// The hardware layer receives one of these from `Hardware::spawn_node` and is
/// responsible for constructing the node from it. The record is plain data so
/// it can be shipped to another machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    pub id: NodeId,
    /// Secret the new node derives its transport material from.
    pub secret: u64,
    #[serde(default)]
    pub settings: NodeSettings,
    /// A participant role the node must eventually run once it starts.
    ///
    /// Written by `spawn_enlist`; opaque to this crate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_participant_role: Option<serde_json::Value>,
    /// Application specific configuration.
    #[serde(default)]
    pub program: serde_json::Value,
}

impl NodeConfig {
    pub fn new(id: NodeId, secret: u64) -> Self {
        Self {
            id,
            secret,
            settings: NodeSettings::default(),
            start_participant_role: None,
            program: serde_json::Value::Null,
        }
    }

    pub fn with_settings(mut self, settings: NodeSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_program(mut self, program: serde_json::Value) -> Self {
        self.program = program;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_display_is_fixed_width_hex() {
        assert_eq!(NodeId(0xab).to_string(), format!("{:0>32}", "ab"));
    }

    #[test]
    fn test_node_id_serializes_as_string() {
        let json = serde_json::to_string(&NodeId(255)).unwrap();
        assert_eq!(json, format!("\"{:0>32}\"", "ff"));
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, NodeId(255));
    }

    #[test]
    fn test_node_id_rejects_garbage() {
        assert!(serde_json::from_str::<NodeId>("\"not-hex\"").is_err());
    }

    #[test]
    fn test_node_config_defaults() {
        let config: NodeConfig =
            serde_json::from_str(&format!("{{\"id\":\"{}\",\"secret\":7}}", NodeId(3))).unwrap();
        assert_eq!(config.id, NodeId(3));
        assert!(config.start_participant_role.is_none());
        assert_eq!(config.settings, NodeSettings::default());
    }
}
