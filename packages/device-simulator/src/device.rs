//! One simulated device: publishes a status message on an interval, reacts
//! to capture/sleep commands, and on capture publishes metadata followed by
//! a chunk burst — honoring NACKs by resending exactly the chunks the
//! server says are missing. Each device owns its own MQTT client handle and
//! runs as an independent `tokio::spawn`ed task, so one device's slow
//! broker round trip never blocks another's.

use std::time::Duration;

use device_types::{ChunkMessage, ImageMetadataMessage, ServerCommand, ServerNack, StatusMessage};
use rand::Rng;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use crate::image;

#[derive(Clone)]
pub struct DeviceProfile {
    pub hw_id: String,
    pub image_size: usize,
    pub max_chunk_size: usize,
    pub status_interval: Duration,
}

pub async fn run(profile: DeviceProfile, mqtt_host: String, mqtt_port: u16) {
    let mut options = MqttOptions::new(
        format!("device-sim-{}", profile.hw_id),
        mqtt_host,
        mqtt_port,
    );
    options.set_keep_alive(Duration::from_secs(30));
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    let cmd_topic = format!("DEVICE/{}/cmd", profile.hw_id);
    let ack_topic = format!("DEVICE/{}/ack", profile.hw_id);
    let data_topic = format!("DEVICE/{}/data", profile.hw_id);
    let status_topic = format!("DEVICE/{}/status", profile.hw_id);

    if let Err(e) = client.subscribe(&cmd_topic, QoS::AtMostOnce).await {
        warn!("{}: failed to subscribe to {cmd_topic}: {e}", profile.hw_id);
        return;
    }
    if let Err(e) = client.subscribe(&ack_topic, QoS::AtMostOnce).await {
        warn!("{}: failed to subscribe to {ack_topic}: {e}", profile.hw_id);
        return;
    }

    let mut current_image: Option<CaptureInFlight> = None;
    let mut status_ticker = tokio::time::interval(profile.status_interval);

    loop {
        tokio::select! {
            _ = status_ticker.tick() => {
                let status = StatusMessage {
                    device_id: profile.hw_id.clone(),
                    status: "alive".to_string(),
                    pending_img: Some(current_image.is_some() as i64),
                };
                publish(&client, &status_topic, &status).await;
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        handle_inbound(&client, &profile, &data_topic, &mut current_image, &p.topic, &p.payload).await;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("{}: mqtt event loop error: {e}", profile.hw_id);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

struct CaptureInFlight {
    image_name: String,
    total_chunk_count: u32,
    chunks: Vec<String>,
}

async fn handle_inbound(
    client: &AsyncClient,
    profile: &DeviceProfile,
    data_topic: &str,
    current_image: &mut Option<CaptureInFlight>,
    topic: &str,
    payload: &[u8],
) {
    if topic.ends_with("/cmd") {
        let Ok(cmd) = serde_json::from_slice::<ServerCommand>(payload) else {
            return;
        };
        if let ServerCommand::Capture { .. } = cmd {
            start_capture(client, profile, data_topic, current_image).await;
        }
    } else if topic.ends_with("/ack") {
        if let Ok(nack) = serde_json::from_slice::<ServerNack>(payload) {
            resend_missing(client, profile, data_topic, current_image, &nack).await;
        }
    }
}

async fn start_capture(
    client: &AsyncClient,
    profile: &DeviceProfile,
    data_topic: &str,
    current_image: &mut Option<CaptureInFlight>,
) {
    let seed = rand::thread_rng().gen();
    let image_name = format!("image_{}.jpg", seed % 100_000);
    let jpeg = image::synthetic_jpeg(profile.image_size, seed);
    let sha256 = image::sha256_hex(&jpeg);
    let chunks = image::chunk_and_encode(&jpeg, profile.max_chunk_size);
    let total_chunk_count = chunks.len() as u32;

    info!(
        "{}: capturing {image_name} ({} bytes, {total_chunk_count} chunks)",
        profile.hw_id,
        jpeg.len()
    );

    let metadata = ImageMetadataMessage {
        device_id: profile.hw_id.clone(),
        capture_timestamp: Some(chrono::Utc::now().to_rfc3339()),
        image_name: image_name.clone(),
        image_size: Some(jpeg.len() as u64),
        max_chunks_size: Some(profile.max_chunk_size as u32),
        total_chunk_count: Some(total_chunk_count),
        location: None,
        error: Some(0),
        temperature: Some(22.0 + rand::thread_rng().gen_range(-2.0..2.0)),
        humidity: Some(45.0 + rand::thread_rng().gen_range(-5.0..5.0)),
        pressure: Some(1013.0 + rand::thread_rng().gen_range(-3.0..3.0)),
        gas_resistance: Some(120.0 + rand::thread_rng().gen_range(-10.0..10.0)),
        sha256: Some(sha256),
    };
    publish(client, data_topic, &metadata).await;

    for (chunk_id, payload) in chunks.iter().enumerate() {
        let msg = ChunkMessage {
            device_id: profile.hw_id.clone(),
            image_name: image_name.clone(),
            chunk_id: chunk_id as u32,
            max_chunk_size: Some(profile.max_chunk_size as u32),
            payload: payload.clone(),
        };
        publish(client, data_topic, &msg).await;
    }

    *current_image = Some(CaptureInFlight {
        image_name,
        total_chunk_count,
        chunks,
    });
}

async fn resend_missing(
    client: &AsyncClient,
    profile: &DeviceProfile,
    data_topic: &str,
    current_image: &mut Option<CaptureInFlight>,
    nack: &ServerNack,
) {
    let Some(capture) = current_image else { return };
    if capture.image_name != nack.image_name {
        debug!(
            "{}: NACK for {} doesn't match in-flight capture {}, ignoring",
            profile.hw_id, nack.image_name, capture.image_name
        );
        return;
    }
    info!(
        "{}: resending {} missing chunk(s) for {}",
        profile.hw_id,
        nack.missing_chunks.len(),
        capture.image_name
    );
    for &chunk_id in &nack.missing_chunks {
        if chunk_id >= capture.total_chunk_count {
            continue;
        }
        let msg = ChunkMessage {
            device_id: profile.hw_id.clone(),
            image_name: capture.image_name.clone(),
            chunk_id,
            max_chunk_size: Some(profile.max_chunk_size as u32),
            payload: capture.chunks[chunk_id as usize].clone(),
        };
        publish(client, data_topic, &msg).await;
    }
}

async fn publish<T: serde::Serialize>(client: &AsyncClient, topic: &str, msg: &T) {
    let Ok(payload) = serde_json::to_vec(msg) else { return };
    if let Err(e) = client.publish(topic, QoS::AtMostOnce, false, payload).await {
        warn!("failed to publish to {topic}: {e}");
    }
}
