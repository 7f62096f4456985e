// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The structural value tree the serializer walks.
//!
//! An [`RpcValue`] is JSON extended with resource leaves: procedures, stream
//! ends, and whole transports. Scalars and resource-free subtrees are kept as
//! plain [`JsonValue`]s; containers that hold resources stay structural so
//! the serializer can find and register every leaf.

use std::sync::Arc;

use indexmap::IndexMap;
use meshkit_core::{JsonValue, Transport};

use crate::pin::PinProxy;
use crate::router::Procedure;
use crate::stream::{StreamReader, StreamWriter};

#[derive(Clone)]
pub enum RpcValue {
    /// A resource-free JSON subtree (scalars included).
    Json(JsonValue),
    Array(Vec<RpcValue>),
    Object(IndexMap<String, RpcValue>),
    /// A locally callable procedure; serializes to a pin placeholder.
    Procedure(Procedure),
    /// A proxy for a procedure owned by a remote peer.
    Pin(PinProxy),
    /// The consuming end of a stream; the serializer will pump it to the peer.
    Reader(StreamReader),
    /// The producing end of a stream; the peer receives a writer proxy.
    Writer(StreamWriter),
    /// A whole transport, tunneled through the connection.
    Transport(Arc<dyn Transport>),
}

impl RpcValue {
    pub fn null() -> Self {
        Self::Json(JsonValue::Null)
    }

    /// Converts into a plain JSON value.
    ///
    /// Returns `None` when the tree holds any resource leaf.
    pub fn into_plain(self) -> Option<JsonValue> {
        match self {
            Self::Json(value) => Some(value),
            Self::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(item.into_plain()?);
                }
                Some(JsonValue::Array(out))
            }
            Self::Object(fields) => {
                let mut out = serde_json::Map::with_capacity(fields.len());
                for (key, value) in fields {
                    out.insert(key, value.into_plain()?);
                }
                Some(JsonValue::Object(out))
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Json(JsonValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Json(JsonValue::Number(n)) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Json(JsonValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Whether this tree contains any resource leaf.
    pub fn has_resources(&self) -> bool {
        match self {
            Self::Json(_) => false,
            Self::Array(items) => items.iter().any(Self::has_resources),
            Self::Object(fields) => fields.values().any(Self::has_resources),
            _ => true,
        }
    }
}

impl From<JsonValue> for RpcValue {
    fn from(value: JsonValue) -> Self {
        Self::Json(value)
    }
}

impl From<&str> for RpcValue {
    fn from(value: &str) -> Self {
        Self::Json(JsonValue::String(value.to_string()))
    }
}

impl From<String> for RpcValue {
    fn from(value: String) -> Self {
        Self::Json(JsonValue::String(value))
    }
}

impl From<i64> for RpcValue {
    fn from(value: i64) -> Self {
        Self::Json(JsonValue::from(value))
    }
}

impl From<bool> for RpcValue {
    fn from(value: bool) -> Self {
        Self::Json(JsonValue::Bool(value))
    }
}

impl std::fmt::Debug for RpcValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Json(value) => write!(f, "Json({value})"),
            Self::Array(items) => f.debug_tuple("Array").field(&items.len()).finish(),
            Self::Object(fields) => {
                let keys: Vec<&str> = fields.keys().map(String::as_str).collect();
                f.debug_tuple("Object").field(&keys).finish()
            }
            Self::Procedure(p) => write!(f, "{p:?}"),
            Self::Pin(p) => write!(f, "{p:?}"),
            Self::Reader(_) => f.write_str("Reader"),
            Self::Writer(_) => f.write_str("Writer"),
            Self::Transport(_) => f.write_str("Transport"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_conversion_rejects_resources() {
        let plain = RpcValue::Array(vec![RpcValue::from(1_i64), RpcValue::from("x")]);
        assert_eq!(plain.into_plain(), Some(serde_json::json!([1, "x"])));

        let resourceful = RpcValue::Array(vec![RpcValue::Procedure(Procedure::new(
            |_args, _ctx| async move { Ok(RpcValue::null()) },
        ))]);
        assert!(resourceful.has_resources());
        assert_eq!(resourceful.into_plain(), None);
    }
}
