// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Structural serialization with resource type handlers.
//!
//! Encoding walks an [`RpcValue`] tree into a plain JSON document, replacing
//! every resource leaf with an `_erpc_type`-tagged placeholder and
//! registering the live handle with the matching manager as a side effect.
//! Decoding reverses the walk; an unknown placeholder tag is a hard error.
//!
//! Plain JSON objects that happen to carry the tag key themselves are
//! wrapped in an `escaped` placeholder so user data can never be mistaken
//! for a resource. Cycles are not representable in an [`RpcValue`]; the
//! depth limit bounds pathological nesting.

use meshkit_core::{JsonValue, WireError};
use serde_json::json;
use uuid::Uuid;

use crate::node::Caps;
use crate::pin::PinProxy;
use crate::stream::{pipe, StreamWriter};
use crate::value::RpcValue;

pub(crate) const TYPE_TAG: &str = "_erpc_type";

/// Encodes a call's argument list into a JSON array.
pub(crate) fn encode_args(args: Vec<RpcValue>, caps: &Caps) -> Result<JsonValue, WireError> {
    let mut out = Vec::with_capacity(args.len());
    for arg in args {
        out.push(encode_value(arg, caps, 1)?);
    }
    Ok(JsonValue::Array(out))
}

/// Decodes a call's argument list.
pub(crate) fn decode_args(value: JsonValue, caps: &Caps) -> Result<Vec<RpcValue>, WireError> {
    match value {
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_value(item, caps, 1)?);
            }
            Ok(out)
        }
        other => Err(WireError::serialization(format!(
            "argument list must be an array, got {other}"
        ))),
    }
}

pub(crate) fn encode_value(value: RpcValue, caps: &Caps, depth: usize) -> Result<JsonValue, WireError> {
    if depth > caps.config.depth_limit {
        return Err(WireError::serialization("value nesting exceeds the depth limit"));
    }
    match value {
        RpcValue::Json(plain) => encode_plain(plain, caps.config.depth_limit, depth),
        RpcValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_value(item, caps, depth + 1)?);
            }
            Ok(JsonValue::Array(out))
        }
        RpcValue::Object(fields) => {
            let mut out = serde_json::Map::with_capacity(fields.len());
            for (key, field) in fields {
                out.insert(key, encode_value(field, caps, depth + 1)?);
            }
            Ok(JsonValue::Object(out))
        }
        RpcValue::Procedure(procedure) => {
            let pin_id = caps.pins.register(&procedure);
            Ok(json!({ TYPE_TAG: "pin", "pinId": pin_id }))
        }
        RpcValue::Pin(proxy) => {
            // A pin received from one peer and forwarded to another is
            // re-pinned here, so the next hop's calls route back through us.
            let pin_id = caps.pins.register(&proxy.as_procedure());
            Ok(json!({ TYPE_TAG: "pin", "pinId": pin_id }))
        }
        RpcValue::Reader(reader) => {
            let stream_id = Uuid::new_v4();
            caps.streams.register_outgoing(stream_id, reader);
            Ok(json!({ TYPE_TAG: "stream", "streamId": stream_id, "direction": "outbound" }))
        }
        RpcValue::Writer(writer) => {
            let stream_id = Uuid::new_v4();
            bind_writer(stream_id, writer, caps);
            Ok(json!({ TYPE_TAG: "stream", "streamId": stream_id, "direction": "inbound" }))
        }
        RpcValue::Transport(transport) => {
            let tunnel_id = caps.tunnels.register_bridge(transport);
            Ok(json!({ TYPE_TAG: "transport_tunnel", "tunnelId": tunnel_id }))
        }
    }
}

/// Routes future incoming chunks for `stream_id` into `writer`.
fn bind_writer(stream_id: Uuid, writer: StreamWriter, caps: &Caps) {
    if let Some(buffer) = writer.as_local() {
        caps.streams.bind_incoming_buffer(stream_id, buffer);
        return;
    }
    // The writer is itself a proxy for a third party: bridge it through a
    // local pipe so chunks keep flowing hop by hop.
    let (local_writer, local_reader) = pipe(caps.config.stream_capacity);
    if let Some(buffer) = local_writer.as_local() {
        caps.streams.bind_incoming_buffer(stream_id, buffer);
    }
    tokio::spawn(async move {
        loop {
            match local_reader.next().await {
                Ok(Some(chunk)) => {
                    if writer.push(chunk).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    writer.finish();
                    break;
                }
                Err(reason) => {
                    writer.abort(reason);
                    break;
                }
            }
        }
    });
}

pub(crate) fn decode_value(value: JsonValue, caps: &Caps, depth: usize) -> Result<RpcValue, WireError> {
    if depth > caps.config.depth_limit {
        return Err(WireError::serialization("value nesting exceeds the depth limit"));
    }
    match value {
        JsonValue::Object(map) if map.contains_key(TYPE_TAG) => decode_placeholder(map, caps, depth),
        JsonValue::Object(map) => {
            let mut fields = indexmap::IndexMap::with_capacity(map.len());
            for (key, field) in map {
                fields.insert(key, decode_value(field, caps, depth + 1)?);
            }
            collapse_object(fields)
        }
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(decode_value(item, caps, depth + 1)?);
            }
            collapse_array(out)
        }
        scalar => Ok(RpcValue::Json(scalar)),
    }
}

fn decode_placeholder(
    map: serde_json::Map<String, JsonValue>,
    caps: &Caps,
    depth: usize,
) -> Result<RpcValue, WireError> {
    let tag = map
        .get(TYPE_TAG)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| WireError::serialization("placeholder tag must be a string"))?;
    match tag {
        "pin" => {
            let pin_id = placeholder_uuid(&map, "pinId")?;
            Ok(RpcValue::Pin(PinProxy::new(pin_id, caps.calls.clone())))
        }
        "stream" => {
            let stream_id = placeholder_uuid(&map, "streamId")?;
            match map.get("direction").and_then(JsonValue::as_str) {
                // The peer pumps chunks to us; hand out the reader end.
                Some("outbound") => Ok(RpcValue::Reader(caps.streams.register_incoming(stream_id))),
                // The peer expects chunks from us; hand out a writer proxy.
                Some("inbound") => {
                    Ok(RpcValue::Writer(StreamWriter::remote(stream_id, caps.outbound.clone())))
                }
                other => Err(WireError::serialization(format!(
                    "invalid stream direction: {other:?}"
                ))),
            }
        }
        "transport_tunnel" => {
            let tunnel_id = placeholder_uuid(&map, "tunnelId")?;
            Ok(RpcValue::Transport(caps.tunnels.create_proxy(tunnel_id)))
        }
        "escaped" => {
            let inner = map
                .get("value")
                .cloned()
                .ok_or_else(|| WireError::serialization("escaped placeholder without value"))?;
            Ok(RpcValue::Json(unescape_plain(inner, depth)?))
        }
        other => Err(WireError::UnknownPlaceholder { tag: other.to_string() }),
    }
}

fn placeholder_uuid(map: &serde_json::Map<String, JsonValue>, key: &str) -> Result<Uuid, WireError> {
    map.get(key)
        .and_then(JsonValue::as_str)
        .map(Uuid::parse_str)
        .transpose()
        .ok()
        .flatten()
        .ok_or_else(|| WireError::serialization(format!("placeholder is missing a valid {key}")))
}

fn collapse_object(fields: indexmap::IndexMap<String, RpcValue>) -> Result<RpcValue, WireError> {
    if fields.values().any(RpcValue::has_resources) {
        return Ok(RpcValue::Object(fields));
    }
    RpcValue::Object(fields)
        .into_plain()
        .map(RpcValue::Json)
        .ok_or_else(|| WireError::serialization("plain object failed to collapse"))
}

fn collapse_array(items: Vec<RpcValue>) -> Result<RpcValue, WireError> {
    if items.iter().any(RpcValue::has_resources) {
        return Ok(RpcValue::Array(items));
    }
    RpcValue::Array(items)
        .into_plain()
        .map(RpcValue::Json)
        .ok_or_else(|| WireError::serialization("plain array failed to collapse"))
}

/// Deep-walks a plain JSON tree, wrapping any object that carries the tag
/// key so it cannot be mistaken for a placeholder on the other side.
pub(crate) fn encode_plain(value: JsonValue, limit: usize, depth: usize) -> Result<JsonValue, WireError> {
    if depth > limit {
        return Err(WireError::serialization("value nesting exceeds the depth limit"));
    }
    match value {
        JsonValue::Object(map) => {
            let escaped = map.contains_key(TYPE_TAG);
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, field) in map {
                out.insert(key, encode_plain(field, limit, depth + 1)?);
            }
            if escaped {
                Ok(json!({ TYPE_TAG: "escaped", "value": JsonValue::Object(out) }))
            } else {
                Ok(JsonValue::Object(out))
            }
        }
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(encode_plain(item, limit, depth + 1)?);
            }
            Ok(JsonValue::Array(out))
        }
        scalar => Ok(scalar),
    }
}

/// Reverses [`encode_plain`]'s escaping.
pub(crate) fn unescape_plain(value: JsonValue, depth: usize) -> Result<JsonValue, WireError> {
    match value {
        JsonValue::Object(map) => {
            if map.get(TYPE_TAG).and_then(JsonValue::as_str) == Some("escaped") {
                let inner = map
                    .get("value")
                    .cloned()
                    .ok_or_else(|| WireError::serialization("escaped placeholder without value"))?;
                return unescape_plain(inner, depth + 1);
            }
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, field) in map {
                out.insert(key, unescape_plain(field, depth + 1)?);
            }
            Ok(JsonValue::Object(out))
        }
        JsonValue::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(unescape_plain(item, depth)?);
            }
            Ok(JsonValue::Array(out))
        }
        scalar => Ok(scalar),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_data_with_the_tag_key_is_escaped_and_restored() {
        let tricky = json!({ "_erpc_type": "pin", "pinId": "not-a-real-pin" });
        let encoded = encode_plain(tricky.clone(), 64, 1).expect("encode");
        assert_eq!(encoded[TYPE_TAG], "escaped");

        let restored = unescape_plain(encoded, 1).expect("decode");
        assert_eq!(restored, tricky);
    }

    #[test]
    fn nested_escapes_roundtrip() {
        let tricky = json!({
            "outer": [{ "_erpc_type": "stream", "inner": { "_erpc_type": "x" } }],
        });
        let encoded = encode_plain(tricky.clone(), 64, 1).expect("encode");
        let restored = unescape_plain(encoded, 1).expect("decode");
        assert_eq!(restored, tricky);
    }

    #[test]
    fn depth_limit_is_enforced() {
        let mut value = json!(0);
        for _ in 0..20 {
            value = json!([value]);
        }
        let err = encode_plain(value, 8, 1).expect_err("too deep");
        assert!(matches!(err, WireError::Serialization { .. }));
    }
}
