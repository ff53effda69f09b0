//! JSON wire protocol for room traffic.
//!
//! Every frame is a JSON object discriminated by its `type` field:
//! ```text
//! follower ──► hub   {"type":"message",    "message": <any>}
//! hub ──► all        {"type":"message",    "sender": "<peer id>", "message": <any>}
//! follower ──► hub   {"type":"storageSet", "prop": "<key>", "value": <any>}
//! hub ──► all        {"type":"storage",    "storage": {"<key>": <any>, ...}}
//! ```
//!
//! Transports carry frames as raw [`serde_json::Value`]s, so whatever a peer
//! sends reaches [`Frame::from_value`] and is rejected there if it is not one
//! of the shapes above.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::store::StoreSnapshot;
use crate::transport::PeerId;

const KNOWN_TYPES: [&str; 3] = ["message", "storageSet", "storage"];

/// A decoded room frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Broadcast payload. `sender` is absent on the way to the hub and set
    /// by the hub when relaying. An inbound `sender` that is not a string
    /// decodes as `None`; the hub overwrites it anyway.
    #[serde(rename = "message")]
    Message {
        #[serde(
            default,
            deserialize_with = "lenient_sender",
            skip_serializing_if = "Option::is_none"
        )]
        sender: Option<PeerId>,
        #[serde(default)]
        message: Value,
    },
    /// Store write request, follower to hub.
    #[serde(rename = "storageSet")]
    StorageSet {
        prop: String,
        #[serde(default)]
        value: Value,
    },
    /// Full store snapshot, hub to everyone.
    #[serde(rename = "storage")]
    Storage { storage: StoreSnapshot },
}

impl Frame {
    /// A broadcast request as sent by a follower.
    pub fn message(payload: impl Into<Value>) -> Self {
        Self::Message {
            sender: None,
            message: payload.into(),
        }
    }

    /// A broadcast as relayed by the hub.
    pub fn relayed(sender: PeerId, payload: Value) -> Self {
        Self::Message {
            sender: Some(sender),
            message: payload,
        }
    }

    /// A store write request.
    pub fn storage_set(prop: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::StorageSet {
            prop: prop.into(),
            value: value.into(),
        }
    }

    /// A full store snapshot.
    pub fn storage(snapshot: StoreSnapshot) -> Self {
        Self::Storage { storage: snapshot }
    }

    /// The wire `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::StorageSet { .. } => "storageSet",
            Self::Storage { .. } => "storage",
        }
    }

    /// Convert to the JSON object handed to a transport.
    pub fn to_value(&self) -> Result<Value, ProtocolError> {
        serde_json::to_value(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a data object received from a transport.
    ///
    /// `null`, non-objects, objects without a known `type` and objects with
    /// the wrong field shapes are all errors; callers drop them.
    pub fn from_value(data: Value) -> Result<Self, ProtocolError> {
        let kind = match &data {
            Value::Object(fields) => match fields.get("type") {
                Some(Value::String(kind)) => kind.clone(),
                Some(_) | None => return Err(ProtocolError::MissingType),
            },
            _ => return Err(ProtocolError::NotAnObject),
        };
        if !KNOWN_TYPES.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownType(kind));
        }
        serde_json::from_value(data).map_err(|e| ProtocolError::Malformed {
            kind,
            reason: e.to_string(),
        })
    }
}

fn lenient_sender<'de, D>(deserializer: D) -> Result<Option<PeerId>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(id)) => Some(PeerId::new(id)),
        _ => None,
    })
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("unknown frame type: {0}")]
    UnknownType(String),
    #[error("malformed {kind} frame: {reason}")]
    Malformed { kind: String, reason: String },
    #[error("serialization error: {0}")]
    Serialization(String),
}
