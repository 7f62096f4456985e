// SPDX-FileCopyrightText: © 2026 MeshKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! The multiplexer's wire packets.
//!
//! Every value that crosses the link is one of these seven packet kinds,
//! serialized as a JSON object tagged by `type`. Channel ids and sequence
//! numbers are the only numeric identifiers in the whole protocol.

use meshkit_core::{JsonValue, WireError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Packet {
    /// Heartbeat probe. Answered by an immediate `pong`.
    Ping,
    /// Heartbeat answer.
    Pong,
    /// First half of the stream-channel handshake.
    #[serde(rename_all = "camelCase")]
    OpenStream { channel_id: u32 },
    /// Second half; both sides consider the channel established.
    #[serde(rename_all = "camelCase")]
    OpenStreamAck { channel_id: u32 },
    /// One in-order payload on a channel.
    #[serde(rename_all = "camelCase")]
    Data { channel_id: u32, seq: u64, payload: JsonValue },
    /// Acknowledges exactly `seq` (acks are individual, not cumulative).
    #[serde(rename_all = "camelCase")]
    Ack { channel_id: u32, seq: u64 },
    /// Best-effort close notification; both sides then destroy locally.
    #[serde(rename_all = "camelCase")]
    CloseChannel {
        channel_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<WireError>,
    },
}

impl Packet {
    /// # Errors
    ///
    /// Fails only if the payload itself cannot be represented, which a
    /// well-formed `JsonValue` never triggers.
    pub fn to_value(&self) -> Result<JsonValue, WireError> {
        serde_json::to_value(self).map_err(|e| WireError::serialization(e.to_string()))
    }

    /// # Errors
    ///
    /// Fails on malformed or unknown packet shapes.
    pub fn from_value(value: JsonValue) -> Result<Self, WireError> {
        serde_json::from_value(value).map_err(|e| WireError::serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_kebab_case() {
        let value = Packet::OpenStream { channel_id: 4 }.to_value().expect("encode");
        assert_eq!(value, serde_json::json!({ "type": "open-stream", "channelId": 4 }));

        let value = Packet::Ack { channel_id: 4, seq: 9 }.to_value().expect("encode");
        assert_eq!(value["type"], "ack");
        assert_eq!(value["seq"], 9);
    }

    #[test]
    fn close_reason_is_optional_on_the_wire() {
        let value = Packet::CloseChannel { channel_id: 2, reason: None }.to_value().expect("encode");
        assert_eq!(value, serde_json::json!({ "type": "close-channel", "channelId": 2 }));

        let back = Packet::from_value(serde_json::json!({
            "type": "close-channel",
            "channelId": 2,
            "reason": { "code": "link-closed", "message": "gone" },
        }))
        .expect("decode");
        assert_eq!(
            back,
            Packet::CloseChannel { channel_id: 2, reason: Some(WireError::link_closed("gone")) }
        );
    }

    #[test]
    fn unknown_packet_type_is_rejected() {
        let result = Packet::from_value(serde_json::json!({ "type": "warp", "channelId": 1 }));
        assert!(result.is_err());
    }
}
