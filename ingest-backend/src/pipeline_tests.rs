//! End-to-end pipeline tests: the six literal scenarios spec.md §8 names,
//! driven through the router and assembly manager against `InMemory*` test
//! doubles. Timers (`retransmit_delay`, `capture_timeout`, the reaper
//! interval) are configured short so the scenarios that depend on them run
//! in real time without a mocked clock.

#![cfg(test)]

use std::sync::Arc;
use std::time::Duration;

use device_types::{ChunkMessage, ImageMetadataMessage};
use tokio::time::sleep;

use crate::assembly::AssemblyManager;
use crate::audit::AuditLogger;
use crate::blobstore::InMemoryBlobStore;
use crate::config::AppConfig;
use crate::error::ErrorCode;
use crate::handshake::Handshake;
use crate::persistence::{InMemoryPersistence, PersistenceFacade};
use crate::transport::InMemoryTransport;
use crate::types::{Capture, DeviceConfig, IngestStatus};

fn test_config() -> AppConfig {
    AppConfig {
        mqtt_host: "localhost".into(),
        mqtt_port: 1883,
        mqtt_tls: false,
        mqtt_username: None,
        mqtt_password: None,
        topic_pattern_data: "DEVICE/+/data".into(),
        topic_pattern_status: "DEVICE/+/status".into(),
        topic_pattern_ack: "DEVICE/+/ack".into(),
        topic_pattern_cmd: "DEVICE/{hw}/cmd".into(),
        storage_bucket: "captures".into(),
        storage_endpoint: "http://localhost:9000".into(),
        capture_timeout: Duration::from_millis(120),
        retransmit_delay: Duration::from_millis(40),
        retransmit_max: 3,
        max_image_bytes: 2 * 1024 * 1024,
        database_url: String::new(),
        admin_http_port: 0,
        command_poll_interval: Duration::from_millis(50),
        max_assemblies_global: 512,
        max_assemblies_per_device: 4,
        reaper_interval: Duration::from_millis(40),
        shutdown_grace: Duration::from_secs(1),
    }
}

struct Harness {
    facade: InMemoryPersistence,
    transport: InMemoryTransport,
    assembly: Arc<AssemblyManager>,
}

async fn harness() -> Harness {
    let facade = InMemoryPersistence::new();
    let transport = InMemoryTransport::new();
    let blob_store = Arc::new(InMemoryBlobStore::new());
    let audit = AuditLogger::new(Arc::new(facade.clone()));
    let config = Arc::new(test_config());
    let assembly = AssemblyManager::new(
        config,
        Arc::new(facade.clone()),
        blob_store,
        Arc::new(transport.clone()),
        audit,
    );
    Harness {
        facade,
        transport,
        assembly,
    }
}

fn default_device_config() -> DeviceConfig {
    DeviceConfig {
        test_mode: true,
        test_interval_minutes: 5,
        capture_interval_hours: 6,
        wakeup_window_sec: 30,
    }
}

/// Polls `find_capture` until it reaches a terminal status or the timeout
/// elapses, returning whatever was last observed. The pipeline finishes
/// asynchronously (dispatch hands off to a per-device worker task), so
/// tests can't assert on state immediately after `dispatch_*` returns.
async fn await_terminal_capture(
    facade: &InMemoryPersistence,
    device_id: uuid::Uuid,
    device_capture_id: &str,
    timeout: Duration,
) -> Option<Capture> {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        if let Some(capture) = facade.find_capture(device_id, device_capture_id).await {
            if capture.ingest_status != IngestStatus::Assembling {
                return Some(capture);
            }
        }
        if waited >= timeout {
            return facade.find_capture(device_id, device_capture_id).await;
        }
        sleep(step).await;
        waited += step;
    }
}

async fn await_any_ack(transport: &InMemoryTransport, timeout: Duration) -> bool {
    let step = Duration::from_millis(10);
    let mut waited = Duration::ZERO;
    loop {
        if transport.sent().await.iter().any(|m| m.topic.ends_with("/ack")) {
            return true;
        }
        if waited >= timeout {
            return false;
        }
        sleep(step).await;
        waited += step;
    }
}

#[tokio::test]
async fn happy_path_assembles_verifies_and_uploads() {
    let h = harness().await;
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    let device_id = h.facade.seed_device(hw_id.clone(), default_device_config()).await;

    h.assembly
        .dispatch_metadata(
            &hw_id,
            ImageMetadataMessage {
                device_id: hw_id.to_string(),
                image_name: "a.jpg".into(),
                image_size: Some(4),
                total_chunk_count: Some(2),
                temperature: Some(25.1),
                ..Default::default()
            },
        )
        .await;
    h.assembly
        .dispatch_chunk(
            &hw_id,
            ChunkMessage {
                device_id: hw_id.to_string(),
                image_name: "a.jpg".into(),
                chunk_id: 0,
                max_chunk_size: None,
                payload: "/9g=".into(), // 0xFF 0xD8
            },
        )
        .await;
    h.assembly
        .dispatch_chunk(
            &hw_id,
            ChunkMessage {
                device_id: hw_id.to_string(),
                image_name: "a.jpg".into(),
                chunk_id: 1,
                max_chunk_size: None,
                payload: "/9k=".into(), // 0xFF 0xD9
            },
        )
        .await;

    let capture = await_terminal_capture(&h.facade, device_id, "a.jpg", Duration::from_secs(2))
        .await
        .expect("capture row should exist");
    assert_eq!(capture.ingest_status, IngestStatus::Success);
    assert_eq!(
        capture.sha256.as_deref(),
        Some(crate::finalizer::sha256_of(&[0xFF, 0xD8, 0xFF, 0xD9]).as_str())
    );
    assert!(capture.image_url.is_some());

    let sent = h.transport.sent().await;
    assert!(sent.iter().any(|m| m.topic.ends_with("/ack")
        && serde_json::from_slice::<serde_json::Value>(&m.payload)
            .map(|v| v.get("ACK_OK").is_some())
            .unwrap_or(false)));
}

#[tokio::test]
async fn retransmit_nacks_missing_chunk_then_completes() {
    let h = harness().await;
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    let device_id = h.facade.seed_device(hw_id.clone(), default_device_config()).await;

    h.assembly
        .dispatch_metadata(
            &hw_id,
            ImageMetadataMessage {
                device_id: hw_id.to_string(),
                image_name: "b.jpg".into(),
                image_size: Some(4),
                total_chunk_count: Some(2),
                ..Default::default()
            },
        )
        .await;
    h.assembly
        .dispatch_chunk(
            &hw_id,
            ChunkMessage {
                device_id: hw_id.to_string(),
                image_name: "b.jpg".into(),
                chunk_id: 0,
                max_chunk_size: None,
                payload: "/9g=".into(),
            },
        )
        .await;

    // Withhold chunk 1 long enough for the retransmit timer to fire.
    assert!(
        await_any_ack(&h.transport, Duration::from_secs(1)).await,
        "expected a NACK before the capture completed"
    );

    let sent = h.transport.sent().await;
    let nack = sent.iter().find(|m| m.topic.ends_with("/ack")).unwrap();
    let v: serde_json::Value = serde_json::from_slice(&nack.payload).unwrap();
    assert_eq!(v["missing_chunks"], serde_json::json!([1]));

    h.assembly
        .dispatch_chunk(
            &hw_id,
            ChunkMessage {
                device_id: hw_id.to_string(),
                image_name: "b.jpg".into(),
                chunk_id: 1,
                max_chunk_size: None,
                payload: "/9k=".into(),
            },
        )
        .await;

    let capture = await_terminal_capture(&h.facade, device_id, "b.jpg", Duration::from_secs(2))
        .await
        .expect("capture row should exist");
    assert_eq!(capture.ingest_status, IngestStatus::Success);
}

#[tokio::test]
async fn incomplete_capture_times_out_via_the_reaper() {
    let h = harness().await;
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    let device_id = h.facade.seed_device(hw_id.clone(), default_device_config()).await;

    h.assembly
        .dispatch_metadata(
            &hw_id,
            ImageMetadataMessage {
                device_id: hw_id.to_string(),
                image_name: "c.jpg".into(),
                total_chunk_count: Some(10),
                ..Default::default()
            },
        )
        .await;

    // Drive the reaper directly rather than waiting on a real background
    // task: several ticks past capture_timeout should age the assembly out.
    for _ in 0..6 {
        sleep(Duration::from_millis(40)).await;
        h.assembly.tick_reaper().await;
    }

    let capture = await_terminal_capture(&h.facade, device_id, "c.jpg", Duration::from_secs(1))
        .await
        .expect("capture row should exist");
    assert_eq!(capture.ingest_status, IngestStatus::Failed);
    let errors = h.facade.errors().await;
    assert!(errors.iter().any(|(_, _, code, _)| *code == ErrorCode::AssemblyTimeout));
}

#[tokio::test]
async fn handshake_due_device_gets_capture_and_persists_next_wake() {
    let facade = InMemoryPersistence::new();
    let transport = InMemoryTransport::new();
    let config = Arc::new(test_config());
    let audit = AuditLogger::new(Arc::new(facade.clone()));
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    facade.seed_device(hw_id.clone(), default_device_config()).await;

    let handshake = Handshake::new(config, Arc::new(facade.clone()), Arc::new(transport.clone()), audit);
    handshake
        .clone()
        .handle_status(
            &hw_id,
            device_types::StatusMessage {
                device_id: hw_id.to_string(),
                status: "alive".into(),
                pending_img: Some(0),
            },
        )
        .await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    let v: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
    assert_eq!(v["capture_image"], serde_json::json!(true));
    assert_eq!(v["device_id"], serde_json::json!("AABBCCDDEEFF"));

    let device = facade.resolve_device(&hw_id).await.unwrap().unwrap();
    assert!(device.next_wake_at.is_some());
}

#[tokio::test]
async fn handshake_not_due_device_gets_sleep_and_keeps_next_wake() {
    let facade = InMemoryPersistence::new();
    let transport = InMemoryTransport::new();
    let config = Arc::new(test_config());
    let audit = AuditLogger::new(Arc::new(facade.clone()));
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    let device_id = facade.seed_device(hw_id.clone(), default_device_config()).await;
    let future_wake = chrono::Utc::now() + chrono::Duration::minutes(2);
    facade.update_next_wake(device_id, future_wake).await.unwrap();

    let handshake = Handshake::new(config, Arc::new(facade.clone()), Arc::new(transport.clone()), audit);
    handshake
        .clone()
        .handle_status(
            &hw_id,
            device_types::StatusMessage {
                device_id: hw_id.to_string(),
                status: "alive".into(),
                pending_img: None,
            },
        )
        .await;

    let sent = transport.sent().await;
    assert_eq!(sent.len(), 1);
    let v: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
    assert!(v.get("next_wake").is_some());
    assert!(v.get("capture_image").is_none());

    let device = facade.resolve_device(&hw_id).await.unwrap().unwrap();
    assert_eq!(device.next_wake_at.unwrap().timestamp(), future_wake.timestamp());
}

#[tokio::test]
async fn invalid_jpeg_framing_fails_the_capture_without_uploading() {
    let h = harness().await;
    let hw_id = device_types::DeviceHwId::parse("AABBCCDDEEFF").unwrap();
    let device_id = h.facade.seed_device(hw_id.clone(), default_device_config()).await;

    h.assembly
        .dispatch_metadata(
            &hw_id,
            ImageMetadataMessage {
                device_id: hw_id.to_string(),
                image_name: "d.jpg".into(),
                image_size: Some(4),
                total_chunk_count: Some(1),
                ..Default::default()
            },
        )
        .await;
    h.assembly
        .dispatch_chunk(
            &hw_id,
            ChunkMessage {
                device_id: hw_id.to_string(),
                image_name: "d.jpg".into(),
                chunk_id: 0,
                max_chunk_size: None,
                payload: base64_of(&[0x00, 0x01, 0x02, 0x03]),
            },
        )
        .await;

    let capture = await_terminal_capture(&h.facade, device_id, "d.jpg", Duration::from_secs(2))
        .await
        .expect("capture row should exist");
    assert_eq!(capture.ingest_status, IngestStatus::Failed);
    assert!(capture.image_url.is_none());
    let errors = h.facade.errors().await;
    assert!(errors.iter().any(|(_, _, code, _)| *code == ErrorCode::JpegInvalid));
}

fn base64_of(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}
