//! Internal data model (§3). Wire shapes live in `device-types`; these are
//! the server-side records the persistence façade reads and writes.

use chrono::{DateTime, Utc};
use device_types::DeviceHwId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub hw_id: DeviceHwId,
    pub company_id: Uuid,
    pub next_wake_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub test_mode: bool,
    pub test_interval_minutes: u32,
    pub capture_interval_hours: u32,
    pub wakeup_window_sec: u32,
}

/// Semi-structured sensor readings. The four well-known keys are strict
/// fields; anything else lands in `extra` so forward-compatible additions
/// from newer firmware don't get dropped on the floor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SensorData {
    pub temperature_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub gas_kohm: Option<f64>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl SensorData {
    /// "Sticky first non-null" merge (§4.2): `self`'s non-null fields win;
    /// `other`'s values only fill in fields `self` left null.
    pub fn merge_sticky(&mut self, other: &SensorData) {
        if self.temperature_c.is_none() {
            self.temperature_c = other.temperature_c;
        }
        if self.humidity_pct.is_none() {
            self.humidity_pct = other.humidity_pct;
        }
        if self.pressure_hpa.is_none() {
            self.pressure_hpa = other.pressure_hpa;
        }
        if self.gas_kohm.is_none() {
            self.gas_kohm = other.gas_kohm;
        }
        for (k, v) in &other.extra {
            self.extra.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestStatus {
    Assembling,
    Success,
    Failed,
}

/// A row in the captures table. Most fields are populated incrementally as
/// metadata and chunks arrive; only `device_id`/`device_capture_id` are
/// guaranteed from the first sighting onward.
#[derive(Debug, Clone)]
pub struct Capture {
    pub id: Uuid,
    pub device_id: Uuid,
    pub device_capture_id: String,
    pub declared_size: Option<u64>,
    pub total_chunk_count: Option<u32>,
    pub max_chunk_size: Option<u32>,
    pub captured_at: Option<DateTime<Utc>>,
    pub sha256: Option<String>,
    pub sensor_data: SensorData,
    pub ingest_status: IngestStatus,
    pub storage_path: Option<String>,
    pub image_url: Option<String>,
}

impl Capture {
    pub fn new(device_id: Uuid, device_capture_id: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id,
            device_capture_id,
            declared_size: None,
            total_chunk_count: None,
            max_chunk_size: None,
            captured_at: None,
            sha256: None,
            sensor_data: SensorData::default(),
            ingest_status: IngestStatus::Assembling,
            storage_path: None,
            image_url: None,
        }
    }

    /// Apply the sticky-first-non-null merge rule to the scalar metadata
    /// fields (§4.2). `sensor_data` is merged separately, key by key.
    pub fn merge_metadata_sticky(&mut self, incoming: &MetadataFields) {
        if self.declared_size.is_none() {
            self.declared_size = incoming.declared_size;
        }
        if self.total_chunk_count.is_none() {
            self.total_chunk_count = incoming.total_chunk_count;
        }
        if self.max_chunk_size.is_none() {
            self.max_chunk_size = incoming.max_chunk_size;
        }
        if self.captured_at.is_none() {
            self.captured_at = incoming.captured_at;
        }
        if self.sha256.is_none() {
            self.sha256 = incoming.sha256.clone();
        }
        self.sensor_data.merge_sticky(&incoming.sensor_data);
    }
}

/// The subset of `ImageMetadataMessage` relevant to sticky-merge, decoupled
/// from the wire struct so the assembly manager isn't coupled to JSON shape.
#[derive(Debug, Clone, Default)]
pub struct MetadataFields {
    pub declared_size: Option<u64>,
    pub total_chunk_count: Option<u32>,
    pub max_chunk_size: Option<u32>,
    pub captured_at: Option<DateTime<Utc>>,
    pub sha256: Option<String>,
    pub sensor_data: SensorData,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandStatus {
    Queued,
    Sent,
    Acknowledged,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Command {
    pub id: Uuid,
    pub device_id: Uuid,
    pub command_type: String,
    pub payload: serde_json::Value,
    pub status: CommandStatus,
    pub requested_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}
