//! Wire-format types shared between `ingest-backend` and `device-simulator`.
//!
//! These mirror the loose JSON the device fleet actually publishes: most
//! fields are optional because a retransmission may omit anything the
//! receiver already has. Parsing is permissive — unknown fields are ignored
//! rather than rejected, since firmware revisions add fields faster than
//! this crate gets updated.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A device hardware id: a stable, uppercase 12-hex-character MAC.
///
/// Validated once, at the boundary where it is first observed (the router
/// for inbound topics, the simulator's config for synthetic devices) —
/// everywhere else it's a cheap, already-valid newtype.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceHwId(String);

impl DeviceHwId {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 12 && raw.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_lowercase())
        {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceHwId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for DeviceHwId {
    type Error = String;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw).ok_or_else(|| format!("not a valid hardware id: {raw:?}"))
    }
}

/// Inbound `DEVICE/{hw}/status`: `{ "device_id", "status", "pendingImg" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub device_id: String,
    pub status: String,
    #[serde(rename = "pendingImg", default)]
    pub pending_img: Option<i64>,
}

/// Inbound `DEVICE/{hw}/data`, metadata shape. Every field but `device_id`
/// and `image_name` may be null — a retransmission of metadata the device
/// thinks may not have landed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageMetadataMessage {
    pub device_id: String,
    #[serde(rename = "capture_timeStamp", default)]
    pub capture_timestamp: Option<String>,
    pub image_name: String,
    #[serde(default)]
    pub image_size: Option<u64>,
    #[serde(default)]
    pub max_chunks_size: Option<u32>,
    #[serde(default)]
    pub total_chunk_count: Option<u32>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub error: Option<u8>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub humidity: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub gas_resistance: Option<f64>,
    /// Present when the device itself computed a digest; absent on first
    /// metadata sighting in the common case.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Inbound `DEVICE/{hw}/data`, chunk shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMessage {
    pub device_id: String,
    pub image_name: String,
    pub chunk_id: u32,
    #[serde(default)]
    pub max_chunk_size: Option<u32>,
    /// Base64-encoded fragment of the JPEG.
    pub payload: String,
}

/// Untyped classification result for whatever landed on the `data` topic.
/// The router decides which of these a payload is by content, not topic.
#[derive(Debug, Clone)]
pub enum DataPayload {
    Metadata(ImageMetadataMessage),
    Chunk(ChunkMessage),
}

/// Inbound `DEVICE/{hw}/ack`: arbitrary device-originated JSON, optionally
/// carrying a `command_id` for the at-least-once command-ack handshake.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceAckMessage {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// Outbound `DEVICE/{hw}/ack`, success case.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerAckOk {
    pub image_name: String,
    #[serde(rename = "ACK_OK")]
    pub ack_ok: AckOkBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckOkBody {
    pub next_wake_time: String,
}

/// Outbound `DEVICE/{hw}/ack`, retransmit request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerNack {
    pub image_name: String,
    pub missing_chunks: Vec<u32>,
}

/// Outbound `DEVICE/{hw}/cmd`. The two shapes share no fields beyond
/// `device_id`, so this is `untagged` rather than internally tagged —
/// matching the device's actual wire shape rather than adding a `type` tag
/// real firmware doesn't send.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerCommand {
    Capture {
        device_id: String,
        capture_image: bool,
    },
    Sleep {
        device_id: String,
        next_wake: String,
    },
}

impl ServerCommand {
    pub fn capture(device_id: &DeviceHwId) -> Self {
        Self::Capture {
            device_id: device_id.to_string(),
            capture_image: true,
        }
    }

    pub fn sleep_until(device_id: &DeviceHwId, next_wake_iso8601: String) -> Self {
        Self::Sleep {
            device_id: device_id.to_string(),
            next_wake: next_wake_iso8601,
        }
    }
}

/// Operator-issued command shapes, as injected via the admin surface and
/// replayed verbatim by the command poller. `command_type` mirrors
/// `Command.command_type` in the persistence façade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorCommandRequest {
    pub device_id: String,
    pub command_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hw_id_rejects_lowercase_and_wrong_length() {
        assert!(DeviceHwId::parse("AABBCCDDEEFF").is_some());
        assert!(DeviceHwId::parse("aabbccddeeff").is_none());
        assert!(DeviceHwId::parse("AABBCCDDEE").is_none());
        assert!(DeviceHwId::parse("AABBCCDDEEFFAA").is_none());
        assert!(DeviceHwId::parse("AABBCCDDEEFG").is_none());
    }

    #[test]
    fn server_command_serializes_without_a_type_tag() {
        let hw = DeviceHwId::parse("AABBCCDDEEFF").unwrap();
        let cmd = ServerCommand::capture(&hw);
        let v = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v["capture_image"], serde_json::json!(true));
        assert!(v.get("next_wake").is_none());
    }

    #[test]
    fn metadata_message_tolerates_all_nulls_but_the_name() {
        let raw = r#"{"device_id":"AABBCCDDEEFF","image_name":"a.jpg"}"#;
        let msg: ImageMetadataMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.image_name, "a.jpg");
        assert!(msg.image_size.is_none());
    }
}
