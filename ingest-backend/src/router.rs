//! Message router (§4.1): the transport callback's only job. Classifies each
//! inbound payload, audit-logs it verbatim, validates the hardware id, and
//! hands off to the assembly manager or the handshake — never blocking on
//! downstream work itself, per §5's "the router must not block" rule. Drains
//! the inbound channel until it closes; a malformed message never stops the
//! loop.

use std::sync::Arc;

use device_types::{ChunkMessage, DeviceAckMessage, DeviceHwId, ImageMetadataMessage, StatusMessage};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::assembly::AssemblyManager;
use crate::audit::AuditLogger;
use crate::command_poller::CommandPoller;
use crate::error::ErrorCode;
use crate::handshake::Handshake;
use crate::persistence::PersistenceFacade;
use crate::transport::InboundMessage;

pub struct Router {
    facade: Arc<dyn PersistenceFacade>,
    audit: AuditLogger,
    assembly: Arc<AssemblyManager>,
    handshake: Arc<Handshake>,
    poller: Arc<CommandPoller>,
}

impl Router {
    pub fn new(
        facade: Arc<dyn PersistenceFacade>,
        audit: AuditLogger,
        assembly: Arc<AssemblyManager>,
        handshake: Arc<Handshake>,
        poller: Arc<CommandPoller>,
    ) -> Self {
        Self {
            facade,
            audit,
            assembly,
            handshake,
            poller,
        }
    }

    /// Drains the transport's inbound channel until it closes (transport
    /// shutdown). Each message is handled independently; a malformed one
    /// never stops the loop.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<InboundMessage>) {
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
        }
        debug!("router: inbound channel closed, stopping");
    }

    async fn handle(&self, msg: InboundMessage) {
        let payload_value: serde_json::Value = match serde_json::from_slice(&msg.payload) {
            Ok(v) => v,
            Err(_) => {
                self.audit
                    .log_inbound(&msg.topic, &serde_json::Value::Null)
                    .await;
                warn!("router: unparseable payload on {} (PARSE_FAIL)", msg.topic);
                let _ = self
                    .facade
                    .insert_error(None, None, ErrorCode::ParseFail, "inbound JSON unparseable")
                    .await;
                return;
            }
        };
        self.audit.log_inbound(&msg.topic, &payload_value).await;

        let Some(hw_id) = extract_hw_id(&msg.topic) else {
            warn!("router: malformed topic or hardware id: {}", msg.topic);
            let _ = self
                .facade
                .insert_error(None, None, ErrorCode::BadTopic, &format!("bad topic: {}", msg.topic))
                .await;
            return;
        };

        if msg.topic.ends_with("/status") {
            self.handle_status(&hw_id, payload_value).await;
        } else if msg.topic.ends_with("/data") {
            self.handle_data(&hw_id, payload_value).await;
        } else if msg.topic.ends_with("/ack") {
            self.handle_ack(&hw_id, payload_value).await;
        } else {
            warn!("router: unrecognized topic shape: {}", msg.topic);
            let _ = self
                .facade
                .insert_error(None, None, ErrorCode::BadTopic, &format!("unrecognized topic: {}", msg.topic))
                .await;
        }
    }

    async fn handle_status(&self, hw_id: &DeviceHwId, value: serde_json::Value) {
        let status: StatusMessage = match serde_json::from_value(value) {
            Ok(s) => s,
            Err(_) => {
                let _ = self
                    .facade
                    .insert_error(None, None, ErrorCode::ParseFail, "status payload malformed")
                    .await;
                return;
            }
        };
        self.handshake.clone().handle_status(hw_id, status).await;
    }

    /// Content-based classification, not topic-based: devices multiplex
    /// metadata and chunks on the same `data` topic (§4.1).
    async fn handle_data(&self, hw_id: &DeviceHwId, value: serde_json::Value) {
        let has_chunk_shape = value.get("chunk_id").and_then(|v| v.as_u64()).is_some()
            && value.get("payload").and_then(|v| v.as_str()).is_some();
        let has_metadata_shape =
            value.get("total_chunk_count").is_some() || value.get("image_size").is_some();

        if has_chunk_shape {
            match serde_json::from_value::<ChunkMessage>(value) {
                Ok(chunk) => self.assembly.dispatch_chunk(hw_id, chunk).await,
                Err(_) => {
                    let _ = self
                        .facade
                        .insert_error(None, None, ErrorCode::ParseFail, "chunk payload malformed")
                        .await;
                }
            }
        } else if has_metadata_shape {
            match serde_json::from_value::<ImageMetadataMessage>(value) {
                Ok(meta) => self.assembly.dispatch_metadata(hw_id, meta).await,
                Err(_) => {
                    let _ = self
                        .facade
                        .insert_error(None, None, ErrorCode::ParseFail, "metadata payload malformed")
                        .await;
                }
            }
        } else {
            // Common during retransmission bursts; not an error (§4.1).
            debug!("router: data payload on {hw_id} is neither chunk nor metadata shape, dropping");
        }
    }

    async fn handle_ack(&self, hw_id: &DeviceHwId, value: serde_json::Value) {
        let ack: DeviceAckMessage = match serde_json::from_value(value) {
            Ok(a) => a,
            Err(_) => {
                let _ = self
                    .facade
                    .insert_error(None, None, ErrorCode::ParseFail, "ack payload malformed")
                    .await;
                return;
            }
        };
        self.poller.handle_device_ack(hw_id, ack).await;
    }
}

/// `DEVICE/{hw}/{status,data,ack}` → the second path segment, validated
/// against `^[0-9A-F]{12}$` (§4.1).
fn extract_hw_id(topic: &str) -> Option<DeviceHwId> {
    let mut segments = topic.split('/');
    let _device = segments.next().filter(|s| *s == "DEVICE")?;
    let hw = segments.next()?;
    DeviceHwId::parse(hw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_valid_hw_id_from_topic() {
        assert!(extract_hw_id("DEVICE/AABBCCDDEEFF/status").is_some());
        assert!(extract_hw_id("DEVICE/AABBCCDDEEFF/data").is_some());
    }

    #[test]
    fn rejects_malformed_topics() {
        assert!(extract_hw_id("DEVICE/aabbccddeeff/status").is_none());
        assert!(extract_hw_id("DEVICE/short/status").is_none());
        assert!(extract_hw_id("OTHER/AABBCCDDEEFF/status").is_none());
    }
}
