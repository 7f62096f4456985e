// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Bus envelopes: the messages adjacent buses exchange.
//!
//! Envelopes ride inside RPC calls between bridges. The routed kinds (`p2p`,
//! `broadcast`, `stream`) are built over [`RpcValue`] trees by hand because
//! their payloads may carry resources (pins, streams, transports) that must
//! be re-serialized at every hop. The correlated kinds (`handshake`,
//! `sub-update`, `node-announcement`) are resource-free and use plain serde.

use indexmap::IndexMap;
use meshkit_core::{JsonValue, WireError};
use meshkit_erpc::RpcValue;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{BusId, NodeId, Topic};

/// Where a message entered this bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageSource {
    Local,
    Parent,
    Child(BusId),
}

impl MessageSource {
    /// Route preference order: local beats child beats parent.
    pub(crate) const fn cost(&self) -> u8 {
        match self {
            Self::Local => 0,
            Self::Child(_) => 1,
            Self::Parent => 2,
        }
    }
}

impl std::fmt::Display for MessageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Parent => f.write_str("parent"),
            Self::Child(bus_id) => write!(f, "child({bus_id})"),
        }
    }
}

// ---- routed envelopes ----

#[derive(Debug, Clone)]
pub(crate) enum Envelope {
    P2p(P2pEnvelope),
    Broadcast(BroadcastEnvelope),
    Stream(StreamEnvelope),
}

#[derive(Debug, Clone)]
pub(crate) struct P2pEnvelope {
    pub source_id: NodeId,
    pub source_groups: Vec<String>,
    pub destination_id: NodeId,
    pub payload: P2pPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum P2pPayload {
    Ask { call_id: Uuid, path: String, args: Vec<RpcValue> },
    Tell { path: String, args: Vec<RpcValue> },
    AckResult { call_id: Uuid, result: Result<RpcValue, WireError> },
}

#[derive(Debug, Clone)]
pub(crate) struct BroadcastEnvelope {
    pub source_id: NodeId,
    pub source_groups: Vec<String>,
    pub topic: Topic,
    pub loopback: bool,
    pub payload: BroadcastPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum BroadcastPayload {
    Ask { call_id: Uuid, args: Vec<RpcValue> },
    Tell { args: Vec<RpcValue> },
    AckResult { call_id: Uuid, result_seq: u64, result: Result<RpcValue, WireError> },
    AckFin { call_id: Uuid, total_results: u64 },
}

#[derive(Debug, Clone)]
pub(crate) struct StreamEnvelope {
    pub source_id: NodeId,
    pub destination_id: Option<NodeId>,
    pub topic: Option<Topic>,
    pub payload: StreamPayload,
}

#[derive(Debug, Clone)]
pub(crate) enum StreamPayload {
    Open { stream_id: Uuid },
    Data { stream_id: Uuid, chunk: RpcValue },
    End { stream_id: Uuid },
    Abort { stream_id: Uuid, reason: WireError },
}

// ---- value-tree helpers ----

fn object(fields: Vec<(&str, RpcValue)>) -> RpcValue {
    let mut map = IndexMap::with_capacity(fields.len());
    for (key, value) in fields {
        map.insert(key.to_string(), value);
    }
    RpcValue::Object(map)
}

fn text(s: impl Into<String>) -> RpcValue {
    RpcValue::from(s.into())
}

fn strings(items: &[String]) -> RpcValue {
    RpcValue::Json(JsonValue::Array(items.iter().map(|s| JsonValue::String(s.clone())).collect()))
}

fn args_value(args: Vec<RpcValue>) -> RpcValue {
    RpcValue::Array(args)
}

fn result_value(result: Result<RpcValue, WireError>) -> Result<RpcValue, WireError> {
    Ok(match result {
        Ok(value) => object(vec![("ok", value)]),
        Err(error) => object(vec![(
            "err",
            RpcValue::Json(serde_json::to_value(&error).map_err(|e| WireError::serialization(e.to_string()))?),
        )]),
    })
}

/// Normalizes either structural or collapsed-JSON objects into fields.
fn fields_of(value: RpcValue) -> Result<IndexMap<String, RpcValue>, WireError> {
    match value {
        RpcValue::Object(map) => Ok(map),
        RpcValue::Json(JsonValue::Object(map)) => {
            Ok(map.into_iter().map(|(k, v)| (k, RpcValue::Json(v))).collect())
        }
        other => Err(WireError::serialization(format!("expected an object, got {other:?}"))),
    }
}

fn items_of(value: RpcValue) -> Result<Vec<RpcValue>, WireError> {
    match value {
        RpcValue::Array(items) => Ok(items),
        RpcValue::Json(JsonValue::Array(items)) => Ok(items.into_iter().map(RpcValue::Json).collect()),
        other => Err(WireError::serialization(format!("expected an array, got {other:?}"))),
    }
}

struct Fields(IndexMap<String, RpcValue>);

impl Fields {
    fn take(&mut self, key: &str) -> Result<RpcValue, WireError> {
        self.0
            .shift_remove(key)
            .ok_or_else(|| WireError::serialization(format!("envelope is missing field {key}")))
    }

    fn take_opt(&mut self, key: &str) -> Option<RpcValue> {
        match self.0.shift_remove(key) {
            Some(RpcValue::Json(JsonValue::Null)) | None => None,
            Some(value) => Some(value),
        }
    }

    fn take_str(&mut self, key: &str) -> Result<String, WireError> {
        match self.take(key)? {
            RpcValue::Json(JsonValue::String(s)) => Ok(s),
            other => Err(WireError::serialization(format!("field {key} must be a string, got {other:?}"))),
        }
    }

    fn take_bool_or(&mut self, key: &str, default: bool) -> bool {
        self.take_opt(key).and_then(|v| v.as_bool()).unwrap_or(default)
    }

    fn take_u64(&mut self, key: &str) -> Result<u64, WireError> {
        match self.take(key)? {
            RpcValue::Json(JsonValue::Number(n)) => n
                .as_u64()
                .ok_or_else(|| WireError::serialization(format!("field {key} must be unsigned"))),
            other => Err(WireError::serialization(format!("field {key} must be a number, got {other:?}"))),
        }
    }

    fn take_uuid(&mut self, key: &str) -> Result<Uuid, WireError> {
        let raw = self.take_str(key)?;
        Uuid::parse_str(&raw).map_err(|_| WireError::serialization(format!("field {key} is not a uuid")))
    }

    fn take_strings(&mut self, key: &str) -> Result<Vec<String>, WireError> {
        let items = items_of(self.take(key)?)?;
        items
            .into_iter()
            .map(|item| match item {
                RpcValue::Json(JsonValue::String(s)) => Ok(s),
                other => Err(WireError::serialization(format!("field {key} must hold strings, got {other:?}"))),
            })
            .collect()
    }
}

fn parse_result(value: RpcValue) -> Result<Result<RpcValue, WireError>, WireError> {
    let mut fields = Fields(fields_of(value)?);
    // Presence decides the variant: `ok` may legitimately hold null.
    if fields.0.contains_key("ok") {
        return Ok(Ok(fields.take("ok")?));
    }
    let err = fields.take("err")?;
    let err = err
        .into_plain()
        .ok_or_else(|| WireError::serialization("error payload cannot carry resources"))?;
    let error: WireError =
        serde_json::from_value(err).map_err(|e| WireError::serialization(e.to_string()))?;
    Ok(Err(error))
}

impl Envelope {
    pub fn into_value(self) -> Result<RpcValue, WireError> {
        match self {
            Self::P2p(env) => {
                let payload = match env.payload {
                    P2pPayload::Ask { call_id, path, args } => object(vec![
                        ("kind", text("ask")),
                        ("callId", text(call_id.to_string())),
                        ("path", text(path)),
                        ("args", args_value(args)),
                    ]),
                    P2pPayload::Tell { path, args } => object(vec![
                        ("kind", text("tell")),
                        ("path", text(path)),
                        ("args", args_value(args)),
                    ]),
                    P2pPayload::AckResult { call_id, result } => object(vec![
                        ("kind", text("ack-result")),
                        ("callId", text(call_id.to_string())),
                        ("result", result_value(result)?),
                    ]),
                };
                Ok(object(vec![
                    ("kind", text("p2p")),
                    ("sourceId", text(env.source_id)),
                    ("sourceGroups", strings(&env.source_groups)),
                    ("destinationId", text(env.destination_id)),
                    ("payload", payload),
                ]))
            }
            Self::Broadcast(env) => {
                let payload = match env.payload {
                    BroadcastPayload::Ask { call_id, args } => object(vec![
                        ("kind", text("ask")),
                        ("callId", text(call_id.to_string())),
                        ("args", args_value(args)),
                    ]),
                    BroadcastPayload::Tell { args } => {
                        object(vec![("kind", text("tell")), ("args", args_value(args))])
                    }
                    BroadcastPayload::AckResult { call_id, result_seq, result } => object(vec![
                        ("kind", text("ack-result")),
                        ("callId", text(call_id.to_string())),
                        ("resultSeq", RpcValue::Json(JsonValue::from(result_seq))),
                        ("result", result_value(result)?),
                    ]),
                    BroadcastPayload::AckFin { call_id, total_results } => object(vec![
                        ("kind", text("ack-fin")),
                        ("callId", text(call_id.to_string())),
                        ("totalResults", RpcValue::Json(JsonValue::from(total_results))),
                    ]),
                };
                Ok(object(vec![
                    ("kind", text("broadcast")),
                    ("sourceId", text(env.source_id)),
                    ("sourceGroups", strings(&env.source_groups)),
                    ("topic", text(env.topic)),
                    ("loopback", RpcValue::from(env.loopback)),
                    ("payload", payload),
                ]))
            }
            Self::Stream(env) => {
                let payload = match env.payload {
                    StreamPayload::Open { stream_id } => object(vec![
                        ("kind", text("open")),
                        ("streamId", text(stream_id.to_string())),
                    ]),
                    StreamPayload::Data { stream_id, chunk } => object(vec![
                        ("kind", text("data")),
                        ("streamId", text(stream_id.to_string())),
                        ("chunk", chunk),
                    ]),
                    StreamPayload::End { stream_id } => object(vec![
                        ("kind", text("end")),
                        ("streamId", text(stream_id.to_string())),
                    ]),
                    StreamPayload::Abort { stream_id, reason } => object(vec![
                        ("kind", text("abort")),
                        ("streamId", text(stream_id.to_string())),
                        (
                            "reason",
                            RpcValue::Json(
                                serde_json::to_value(&reason)
                                    .map_err(|e| WireError::serialization(e.to_string()))?,
                            ),
                        ),
                    ]),
                };
                let mut fields = vec![("kind", text("stream")), ("sourceId", text(env.source_id))];
                if let Some(destination_id) = env.destination_id {
                    fields.push(("destinationId", text(destination_id)));
                }
                if let Some(topic) = env.topic {
                    fields.push(("topic", text(topic)));
                }
                fields.push(("payload", payload));
                Ok(object(fields))
            }
        }
    }

    pub fn from_value(value: RpcValue) -> Result<Self, WireError> {
        let mut fields = Fields(fields_of(value)?);
        let kind = fields.take_str("kind")?;
        match kind.as_str() {
            "p2p" => {
                let source_id = fields.take_str("sourceId")?;
                let source_groups = fields.take_strings("sourceGroups")?;
                let destination_id = fields.take_str("destinationId")?;
                let mut payload = Fields(fields_of(fields.take("payload")?)?);
                let payload = match payload.take_str("kind")?.as_str() {
                    "ask" => P2pPayload::Ask {
                        call_id: payload.take_uuid("callId")?,
                        path: payload.take_str("path")?,
                        args: items_of(payload.take("args")?)?,
                    },
                    "tell" => P2pPayload::Tell {
                        path: payload.take_str("path")?,
                        args: items_of(payload.take("args")?)?,
                    },
                    "ack-result" => P2pPayload::AckResult {
                        call_id: payload.take_uuid("callId")?,
                        result: parse_result(payload.take("result")?)?,
                    },
                    other => {
                        return Err(WireError::serialization(format!("unknown p2p payload kind {other}")))
                    }
                };
                Ok(Self::P2p(P2pEnvelope { source_id, source_groups, destination_id, payload }))
            }
            "broadcast" => {
                let source_id = fields.take_str("sourceId")?;
                let source_groups = fields.take_strings("sourceGroups")?;
                let topic = fields.take_str("topic")?;
                let loopback = fields.take_bool_or("loopback", false);
                let mut payload = Fields(fields_of(fields.take("payload")?)?);
                let payload = match payload.take_str("kind")?.as_str() {
                    "ask" => BroadcastPayload::Ask {
                        call_id: payload.take_uuid("callId")?,
                        args: items_of(payload.take("args")?)?,
                    },
                    "tell" => BroadcastPayload::Tell { args: items_of(payload.take("args")?)? },
                    "ack-result" => BroadcastPayload::AckResult {
                        call_id: payload.take_uuid("callId")?,
                        result_seq: payload.take_u64("resultSeq")?,
                        result: parse_result(payload.take("result")?)?,
                    },
                    "ack-fin" => BroadcastPayload::AckFin {
                        call_id: payload.take_uuid("callId")?,
                        total_results: payload.take_u64("totalResults")?,
                    },
                    other => {
                        return Err(WireError::serialization(format!(
                            "unknown broadcast payload kind {other}"
                        )))
                    }
                };
                Ok(Self::Broadcast(BroadcastEnvelope { source_id, source_groups, topic, loopback, payload }))
            }
            "stream" => {
                let source_id = fields.take_str("sourceId")?;
                let destination_id = match fields.take_opt("destinationId") {
                    Some(RpcValue::Json(JsonValue::String(s))) => Some(s),
                    Some(other) => {
                        return Err(WireError::serialization(format!(
                            "destinationId must be a string, got {other:?}"
                        )))
                    }
                    None => None,
                };
                let topic = match fields.take_opt("topic") {
                    Some(RpcValue::Json(JsonValue::String(s))) => Some(s),
                    Some(other) => {
                        return Err(WireError::serialization(format!("topic must be a string, got {other:?}")))
                    }
                    None => None,
                };
                let mut payload = Fields(fields_of(fields.take("payload")?)?);
                let payload = match payload.take_str("kind")?.as_str() {
                    "open" => StreamPayload::Open { stream_id: payload.take_uuid("streamId")? },
                    "data" => StreamPayload::Data {
                        stream_id: payload.take_uuid("streamId")?,
                        chunk: payload.take("chunk")?,
                    },
                    "end" => StreamPayload::End { stream_id: payload.take_uuid("streamId")? },
                    "abort" => {
                        let stream_id = payload.take_uuid("streamId")?;
                        let reason = payload
                            .take("reason")?
                            .into_plain()
                            .ok_or_else(|| WireError::serialization("abort reason cannot carry resources"))?;
                        let reason: WireError = serde_json::from_value(reason)
                            .map_err(|e| WireError::serialization(e.to_string()))?;
                        StreamPayload::Abort { stream_id, reason }
                    }
                    other => {
                        return Err(WireError::serialization(format!("unknown stream payload kind {other}")))
                    }
                };
                Ok(Self::Stream(StreamEnvelope { source_id, destination_id, topic, payload }))
            }
            other => Err(WireError::serialization(format!("unknown envelope kind {other}"))),
        }
    }
}

// ---- correlated exchanges ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SubUpdateEntry {
    pub topic: Topic,
    pub is_subscribed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Announcement {
    pub node_id: NodeId,
    pub is_available: bool,
    pub groups: Vec<String>,
}

/// Correlated bridge-to-bridge control messages; every one is answered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum Exchange {
    #[serde(rename_all = "camelCase")]
    Handshake { correlation_id: Uuid, bus_id: BusId },
    #[serde(rename_all = "camelCase")]
    SubUpdate { correlation_id: Uuid, updates: Vec<SubUpdateEntry> },
    #[serde(rename_all = "camelCase")]
    NodeAnnouncement { correlation_id: Uuid, announcements: Vec<Announcement> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub(crate) enum ExchangeResponse {
    #[serde(rename_all = "camelCase")]
    HandshakeResponse { correlation_id: Uuid, bus_id: BusId },
    #[serde(rename_all = "camelCase")]
    Ack { correlation_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn p2p_ask_roundtrip() {
        let env = Envelope::P2p(P2pEnvelope {
            source_id: "plugin://a".to_string(),
            source_groups: vec!["workers".to_string()],
            destination_id: "plugin://b".to_string(),
            payload: P2pPayload::Ask {
                call_id: Uuid::new_v4(),
                path: "echo".to_string(),
                args: vec![RpcValue::from("hi")],
            },
        });
        let value = env.into_value().expect("encode");
        let back = Envelope::from_value(value).expect("decode");
        let Envelope::P2p(back) = back else { panic!("kind changed") };
        assert_eq!(back.source_id, "plugin://a");
        assert_eq!(back.destination_id, "plugin://b");
        let P2pPayload::Ask { path, args, .. } = back.payload else { panic!("payload changed") };
        assert_eq!(path, "echo");
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn broadcast_fin_roundtrip() {
        let call_id = Uuid::new_v4();
        let env = Envelope::Broadcast(BroadcastEnvelope {
            source_id: "n1".to_string(),
            source_groups: vec![],
            topic: "t".to_string(),
            loopback: true,
            payload: BroadcastPayload::AckFin { call_id, total_results: 3 },
        });
        let value = env.into_value().expect("encode");
        let Envelope::Broadcast(back) = Envelope::from_value(value).expect("decode") else {
            panic!("kind changed")
        };
        assert!(back.loopback);
        let BroadcastPayload::AckFin { call_id: back_id, total_results } = back.payload else {
            panic!("payload changed")
        };
        assert_eq!(back_id, call_id);
        assert_eq!(total_results, 3);
    }

    #[test]
    fn error_results_survive_the_envelope() {
        let env = Envelope::P2p(P2pEnvelope {
            source_id: "a".to_string(),
            source_groups: vec![],
            destination_id: "b".to_string(),
            payload: P2pPayload::AckResult {
                call_id: Uuid::new_v4(),
                result: Err(WireError::node_not_found("ghost")),
            },
        });
        let value = env.into_value().expect("encode");
        let Envelope::P2p(back) = Envelope::from_value(value).expect("decode") else {
            panic!("kind changed")
        };
        let P2pPayload::AckResult { result, .. } = back.payload else { panic!("payload changed") };
        assert_eq!(result.expect_err("is an error"), WireError::node_not_found("ghost"));
    }

    #[test]
    fn null_results_stay_successful() {
        let env = Envelope::P2p(P2pEnvelope {
            source_id: "a".to_string(),
            source_groups: vec![],
            destination_id: "b".to_string(),
            payload: P2pPayload::AckResult {
                call_id: Uuid::new_v4(),
                result: Ok(RpcValue::null()),
            },
        });
        let value = env.into_value().expect("encode");
        let Envelope::P2p(back) = Envelope::from_value(value).expect("decode") else {
            panic!("kind changed")
        };
        let P2pPayload::AckResult { result, .. } = back.payload else { panic!("payload changed") };
        assert!(matches!(result, Ok(RpcValue::Json(JsonValue::Null))));
    }

    #[test]
    fn exchange_wire_shape() {
        let exchange = Exchange::SubUpdate {
            correlation_id: Uuid::new_v4(),
            updates: vec![SubUpdateEntry { topic: "t".to_string(), is_subscribed: true }],
        };
        let value = serde_json::to_value(&exchange).expect("encode");
        assert_eq!(value["kind"], "sub-update");
        assert_eq!(value["updates"][0]["isSubscribed"], true);
    }
}
