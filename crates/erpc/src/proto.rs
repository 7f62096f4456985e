// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Control-channel messages of the RPC runtime.
//!
//! These ride as payloads on a transport's control channel. Stream channels
//! carry only tunnel traffic; their first payload is always a
//! [`StreamHello`] handshake.

use meshkit_core::{JsonValue, WireError};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What a call is addressed to: a router path or a pinned procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum CallTarget {
    Path(String),
    Pin(Uuid),
}

/// The two halves of an `ask-result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOutcome {
    Ok(JsonValue),
    Err(WireError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    /// Expects exactly one `ask-result` with the same call id.
    #[serde(rename_all = "camelCase")]
    Ask {
        call_id: Uuid,
        target: CallTarget,
        args: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<JsonValue>,
    },
    #[serde(rename_all = "camelCase")]
    AskResult { call_id: Uuid, result: CallOutcome },
    /// Fire-and-forget.
    #[serde(rename_all = "camelCase")]
    Tell {
        target: CallTarget,
        args: JsonValue,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<JsonValue>,
    },
    /// Drops `count` references from a remote pin; the target is released
    /// when its count reaches zero.
    #[serde(rename_all = "camelCase")]
    PinFree { pin_id: Uuid, count: u32 },
    #[serde(rename_all = "camelCase")]
    StreamData { stream_id: Uuid, chunk: JsonValue },
    #[serde(rename_all = "camelCase")]
    StreamEnd { stream_id: Uuid },
    #[serde(rename_all = "camelCase")]
    StreamAbort { stream_id: Uuid, reason: WireError },
    /// Opaque relay for a tunneled transport's control traffic.
    #[serde(rename_all = "camelCase")]
    Tunnel { tunnel_id: Uuid, payload: JsonValue },
}

impl ControlMessage {
    /// # Errors
    ///
    /// Fails only when a payload cannot be represented as JSON.
    pub fn to_value(&self) -> Result<JsonValue, WireError> {
        serde_json::to_value(self).map_err(|e| WireError::serialization(e.to_string()))
    }

    /// # Errors
    ///
    /// Fails on malformed or unknown message shapes.
    pub fn from_value(value: JsonValue) -> Result<Self, WireError> {
        serde_json::from_value(value).map_err(|e| WireError::serialization(e.to_string()))
    }
}

/// Which tunnel end a handshaking stream channel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelEndpoint {
    /// The bridge: the side owning the real transport.
    Initiator,
    /// The proxy: the side owning the synthesized transport.
    Receiver,
}

/// First payload on every host stream channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamHello {
    #[serde(rename_all = "camelCase")]
    StreamTunnel {
        tunnel_id: Uuid,
        stream_id: Uuid,
        target_endpoint: TunnelEndpoint,
    },
}

impl StreamHello {
    /// # Errors
    ///
    /// Never fails for well-formed hellos; kept fallible for symmetry with
    /// the other wire types.
    pub fn to_value(&self) -> Result<JsonValue, WireError> {
        serde_json::to_value(self).map_err(|e| WireError::serialization(e.to_string()))
    }

    /// # Errors
    ///
    /// Fails when the first payload of a stream channel is not a handshake.
    pub fn from_value(value: JsonValue) -> Result<Self, WireError> {
        serde_json::from_value(value).map_err(|e| WireError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_wire_shape() {
        let id = Uuid::new_v4();
        let msg = ControlMessage::Ask {
            call_id: id,
            target: CallTarget::Path("math.add".to_string()),
            args: serde_json::json!([1, 2]),
            meta: None,
        };
        let value = msg.to_value().expect("encode");
        assert_eq!(value["type"], "ask");
        assert_eq!(value["callId"], serde_json::json!(id.to_string()));
        assert_eq!(value["target"], serde_json::json!({ "kind": "path", "value": "math.add" }));
        assert!(value.get("meta").is_none());
    }

    #[test]
    fn ask_result_err_carries_classification() {
        let id = Uuid::new_v4();
        let msg = ControlMessage::AskResult {
            call_id: id,
            result: CallOutcome::Err(WireError::procedure("app", "boom")),
        };
        let value = msg.to_value().expect("encode");
        assert_eq!(value["result"]["err"]["code"], "procedure");
        let back = ControlMessage::from_value(value).expect("decode");
        assert_eq!(back, msg);
    }

    #[test]
    fn stream_hello_tags() {
        let hello = StreamHello::StreamTunnel {
            tunnel_id: Uuid::new_v4(),
            stream_id: Uuid::new_v4(),
            target_endpoint: TunnelEndpoint::Receiver,
        };
        let value = hello.to_value().expect("encode");
        assert_eq!(value["type"], "stream-tunnel");
        assert_eq!(value["targetEndpoint"], "receiver");
    }
}
