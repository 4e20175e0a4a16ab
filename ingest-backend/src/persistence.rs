//! Persistence façade (§4.6): the narrow set of operations every other
//! component calls instead of touching SQL directly. Two implementations —
//! `PgPersistence` for production, `InMemoryPersistence` for unit and
//! integration tests — share one trait so the rest of the pipeline never
//! knows which backs it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use device_types::DeviceHwId;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ErrorCode, PersistenceError};
use crate::types::{
    Capture, Command, CommandStatus, Device, DeviceConfig, IngestStatus, MetadataFields,
    SensorData,
};

pub type Result<T> = std::result::Result<T, PersistenceError>;

#[async_trait]
pub trait PersistenceFacade: Send + Sync {
    async fn resolve_device(&self, hw_id: &DeviceHwId) -> Result<Option<Device>>;
    async fn resolve_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>>;
    async fn resolve_device_config(&self, device_id: Uuid) -> Result<Option<DeviceConfig>>;

    /// Idempotent upsert keyed by `(device_id, device_capture_id)`. Creates
    /// the row on first sighting; applies the sticky-first-non-null merge
    /// on subsequent calls. Returns the capture id either way.
    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        device_capture_id: &str,
        fields: &MetadataFields,
    ) -> Result<Uuid>;

    /// No-op if `(capture_id, chunk_id)` already exists. Conflicting
    /// re-submission (same id, different bytes) is the assembly manager's
    /// job to detect *before* calling this — this operation trusts the
    /// caller and is a plain idempotent insert.
    async fn append_chunk(&self, capture_id: Uuid, chunk_id: u32, bytes: &[u8]) -> Result<()>;

    async fn finalize_capture(
        &self,
        capture_id: Uuid,
        storage_path: &str,
        image_url: &str,
        sha256: &str,
        sensor_merge: &SensorData,
    ) -> Result<()>;

    async fn fail_capture(&self, capture_id: Uuid, code: ErrorCode) -> Result<()>;

    async fn update_next_wake(&self, device_id: Uuid, t: DateTime<Utc>) -> Result<()>;

    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<Command>>;
    async fn mark_command_sent(&self, command_id: Uuid, ts: DateTime<Utc>) -> Result<()>;
    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool>;
    async fn insert_command(
        &self,
        device_id: Uuid,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid>;

    async fn insert_device_status(
        &self,
        device_id: Uuid,
        status: &str,
        pending_img: Option<i64>,
    ) -> Result<()>;

    async fn insert_error(
        &self,
        device_id: Option<Uuid>,
        capture_id: Option<Uuid>,
        code: ErrorCode,
        message: &str,
    ) -> Result<()>;

    async fn append_audit(
        &self,
        topic: &str,
        direction: &str,
        payload: &serde_json::Value,
    ) -> Result<()>;
}

// ───────────────────────────── Postgres backend ─────────────────────────────

pub struct PgPersistence {
    pool: PgPool,
}

impl PgPersistence {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceFacade for PgPersistence {
    async fn resolve_device(&self, hw_id: &DeviceHwId) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT id, hw_id, company_id, next_wake_at FROM devices WHERE hw_id = $1")
            .bind(hw_id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Internal(e.into()))?;

        let Some(row) = row else { return Ok(None) };
        let hw: String = row.try_get("hw_id").map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(Some(Device {
            id: row.try_get("id").map_err(|e| PersistenceError::Internal(e.into()))?,
            hw_id: DeviceHwId::parse(&hw).expect("hw_id column is pre-validated"),
            company_id: row.try_get("company_id").map_err(|e| PersistenceError::Internal(e.into()))?,
            next_wake_at: row.try_get("next_wake_at").map_err(|e| PersistenceError::Internal(e.into()))?,
        }))
    }

    async fn resolve_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>> {
        let row = sqlx::query("SELECT id, hw_id, company_id, next_wake_at FROM devices WHERE id = $1")
            .bind(device_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| PersistenceError::Internal(e.into()))?;

        let Some(row) = row else { return Ok(None) };
        let hw: String = row.try_get("hw_id").map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(Some(Device {
            id: row.try_get("id").map_err(|e| PersistenceError::Internal(e.into()))?,
            hw_id: DeviceHwId::parse(&hw).expect("hw_id column is pre-validated"),
            company_id: row.try_get("company_id").map_err(|e| PersistenceError::Internal(e.into()))?,
            next_wake_at: row.try_get("next_wake_at").map_err(|e| PersistenceError::Internal(e.into()))?,
        }))
    }

    async fn resolve_device_config(&self, device_id: Uuid) -> Result<Option<DeviceConfig>> {
        let row = sqlx::query(
            r#"SELECT test_mode, test_interval_minutes, capture_interval_hours, wakeup_window_sec
               FROM device_configs WHERE device_id = $1"#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(DeviceConfig {
            test_mode: row.try_get("test_mode").map_err(|e| PersistenceError::Internal(e.into()))?,
            test_interval_minutes: {
                let v: i32 = row.try_get("test_interval_minutes").map_err(|e| PersistenceError::Internal(e.into()))?;
                v as u32
            },
            capture_interval_hours: {
                let v: i32 = row.try_get("capture_interval_hours").map_err(|e| PersistenceError::Internal(e.into()))?;
                v as u32
            },
            wakeup_window_sec: {
                let v: i32 = row.try_get("wakeup_window_sec").map_err(|e| PersistenceError::Internal(e.into()))?;
                v as u32
            },
        }))
    }

    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        device_capture_id: &str,
        fields: &MetadataFields,
    ) -> Result<Uuid> {
        let sensor_json = serde_json::to_value(&fields.sensor_data)
            .map_err(|e| PersistenceError::Internal(e.into()))?;

        // Sticky-first-non-null is expressed with COALESCE(existing, incoming)
        // on every nullable column. `sensor_data` needs the same rule applied
        // per key rather than a plain `||`: `SensorData` serializes its four
        // well-known keys with explicit `null`s, so the existing object
        // always *has* every key, and a right-biased `||` would let an
        // already-stored null permanently shadow a later non-null reading.
        // Stripping nulls from both sides first means a key still null in
        // the stored row no longer blocks the incoming value; `||` is
        // right-biased, so listing `captures.sensor_data` second gives the
        // existing non-null values priority, matching the in-memory merge.
        let row = sqlx::query(
            r#"
            INSERT INTO captures
                (id, device_id, device_capture_id, declared_size, total_chunk_count,
                 max_chunk_size, captured_at, image_sha256, sensor_data, ingest_status)
            VALUES
                (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, $8, 'assembling')
            ON CONFLICT (device_id, device_capture_id)
                WHERE ingest_status = 'assembling'
            DO UPDATE SET
                declared_size = COALESCE(captures.declared_size, EXCLUDED.declared_size),
                total_chunk_count = COALESCE(captures.total_chunk_count, EXCLUDED.total_chunk_count),
                max_chunk_size = COALESCE(captures.max_chunk_size, EXCLUDED.max_chunk_size),
                captured_at = COALESCE(captures.captured_at, EXCLUDED.captured_at),
                image_sha256 = COALESCE(captures.image_sha256, EXCLUDED.image_sha256),
                sensor_data = jsonb_strip_nulls(EXCLUDED.sensor_data)
                    || jsonb_strip_nulls(captures.sensor_data)
            RETURNING id
            "#,
        )
        .bind(device_id)
        .bind(device_capture_id)
        .bind(fields.declared_size.map(|v| v as i64))
        .bind(fields.total_chunk_count.map(|v| v as i32))
        .bind(fields.max_chunk_size.map(|v| v as i32))
        .bind(fields.captured_at)
        .bind(&fields.sha256)
        .bind(sensor_json)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;

        row.try_get("id").map_err(|e| PersistenceError::Internal(e.into()))
    }

    async fn append_chunk(&self, capture_id: Uuid, chunk_id: u32, bytes: &[u8]) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO chunks (capture_id, chunk_id, payload_bytes)
               VALUES ($1, $2, $3)
               ON CONFLICT (capture_id, chunk_id) DO NOTHING"#,
        )
        .bind(capture_id)
        .bind(chunk_id as i32)
        .bind(bytes)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn finalize_capture(
        &self,
        capture_id: Uuid,
        storage_path: &str,
        image_url: &str,
        sha256: &str,
        sensor_merge: &SensorData,
    ) -> Result<()> {
        let sensor_json = serde_json::to_value(sensor_merge)
            .map_err(|e| PersistenceError::Internal(e.into()))?;
        sqlx::query(
            r#"UPDATE captures
               SET ingest_status = 'success',
                   storage_path = $2,
                   image_url = $3,
                   image_sha256 = $4,
                   sensor_data = jsonb_strip_nulls($5) || jsonb_strip_nulls(sensor_data)
               WHERE id = $1"#,
        )
        .bind(capture_id)
        .bind(storage_path)
        .bind(image_url)
        .bind(sha256)
        .bind(sensor_json)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn fail_capture(&self, capture_id: Uuid, code: ErrorCode) -> Result<()> {
        sqlx::query(
            r#"UPDATE captures SET ingest_status = 'failed' WHERE id = $1 AND ingest_status = 'assembling'"#,
        )
        .bind(capture_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        self.insert_error(None, Some(capture_id), code, code.as_str())
            .await
    }

    async fn update_next_wake(&self, device_id: Uuid, t: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE devices SET next_wake_at = $2 WHERE id = $1")
            .bind(device_id)
            .bind(t)
            .execute(&self.pool)
            .await
            .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<Command>> {
        let rows = sqlx::query(
            r#"SELECT id, device_id, command_type, payload, status, requested_at, sent_at
               FROM commands WHERE status = 'queued' ORDER BY requested_at ASC LIMIT $1"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;

        rows.into_iter()
            .map(|r| {
                Ok(Command {
                    id: r.try_get("id").map_err(|e| PersistenceError::Internal(e.into()))?,
                    device_id: r.try_get("device_id").map_err(|e| PersistenceError::Internal(e.into()))?,
                    command_type: r.try_get("command_type").map_err(|e| PersistenceError::Internal(e.into()))?,
                    payload: r.try_get("payload").map_err(|e| PersistenceError::Internal(e.into()))?,
                    status: CommandStatus::Queued,
                    requested_at: r.try_get("requested_at").map_err(|e| PersistenceError::Internal(e.into()))?,
                    sent_at: r.try_get("sent_at").map_err(|e| PersistenceError::Internal(e.into()))?,
                })
            })
            .collect()
    }

    async fn mark_command_sent(&self, command_id: Uuid, ts: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"UPDATE commands SET status = 'sent', sent_at = $2
               WHERE id = $1 AND status = 'queued'"#,
        )
        .bind(command_id)
        .bind(ts)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE commands SET status = 'acknowledged' WHERE id = $1 AND status = 'sent'",
        )
        .bind(command_id)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_command(
        &self,
        device_id: Uuid,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r#"INSERT INTO commands (id, device_id, command_type, payload, status, requested_at)
               VALUES (gen_random_uuid(), $1, $2, $3, 'queued', now())
               RETURNING id"#,
        )
        .bind(device_id)
        .bind(command_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        row.try_get("id").map_err(|e| PersistenceError::Internal(e.into()))
    }

    async fn insert_device_status(
        &self,
        device_id: Uuid,
        status: &str,
        pending_img: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO device_status_log (device_id, status, pending_img, received_at)
               VALUES ($1, $2, $3, now())"#,
        )
        .bind(device_id)
        .bind(status)
        .bind(pending_img)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn insert_error(
        &self,
        device_id: Option<Uuid>,
        capture_id: Option<Uuid>,
        code: ErrorCode,
        message: &str,
    ) -> Result<()> {
        let severity = match code.severity() {
            crate::error::Severity::Warn => "warn",
            crate::error::Severity::Error => "error",
        };
        sqlx::query(
            r#"INSERT INTO error_log (device_id, capture_id, error_code, severity, message, occurred_at)
               VALUES ($1, $2, $3, $4, $5, now())"#,
        )
        .bind(device_id)
        .bind(capture_id)
        .bind(code.as_str())
        .bind(severity)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }

    async fn append_audit(
        &self,
        topic: &str,
        direction: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO audit_log (topic, direction, payload, received_at)
               VALUES ($1, $2, $3, now())"#,
        )
        .bind(topic)
        .bind(direction)
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(|e| PersistenceError::Internal(e.into()))?;
        Ok(())
    }
}

// ───────────────────────────── In-memory backend ────────────────────────────

/// Test double used by unit and integration tests so the reassembly/
/// handshake/poller pipeline can be exercised end to end without a live
/// Postgres. Guarded by a single `RwLock` since test scale never stresses
/// lock contention — production always runs `PgPersistence`.
#[derive(Default)]
struct MemoryTables {
    devices: HashMap<Uuid, Device>,
    devices_by_hw: HashMap<DeviceHwId, Uuid>,
    device_configs: HashMap<Uuid, DeviceConfig>,
    captures: HashMap<Uuid, Capture>,
    capture_by_key: HashMap<(Uuid, String), Uuid>,
    commands: HashMap<Uuid, Command>,
    errors: Vec<(Option<Uuid>, Option<Uuid>, ErrorCode, String)>,
    audit: Vec<(String, String, serde_json::Value)>,
}

#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    tables: Arc<RwLock<MemoryTables>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test helper: seed a device + config directly, bypassing provisioning.
    pub async fn seed_device(&self, hw_id: DeviceHwId, config: DeviceConfig) -> Uuid {
        let mut t = self.tables.write().await;
        let id = Uuid::new_v4();
        t.devices.insert(
            id,
            Device {
                id,
                hw_id: hw_id.clone(),
                company_id: Uuid::new_v4(),
                next_wake_at: None,
            },
        );
        t.devices_by_hw.insert(hw_id, id);
        t.device_configs.insert(id, config);
        id
    }

    pub async fn get_capture(&self, id: Uuid) -> Option<Capture> {
        self.tables.read().await.captures.get(&id).cloned()
    }

    /// Test helper: look up a capture by its natural key instead of its id,
    /// since callers exercising the pipeline end to end only know the
    /// `(device_id, device_capture_id)` pair the device itself sent.
    pub async fn find_capture(&self, device_id: Uuid, device_capture_id: &str) -> Option<Capture> {
        let t = self.tables.read().await;
        let id = t.capture_by_key.get(&(device_id, device_capture_id.to_string()))?;
        t.captures.get(id).cloned()
    }

    pub async fn errors(&self) -> Vec<(Option<Uuid>, Option<Uuid>, ErrorCode, String)> {
        self.tables.read().await.errors.clone()
    }
}

#[async_trait]
impl PersistenceFacade for InMemoryPersistence {
    async fn resolve_device(&self, hw_id: &DeviceHwId) -> Result<Option<Device>> {
        let t = self.tables.read().await;
        Ok(t.devices_by_hw.get(hw_id).and_then(|id| t.devices.get(id)).cloned())
    }

    async fn resolve_device_by_id(&self, device_id: Uuid) -> Result<Option<Device>> {
        Ok(self.tables.read().await.devices.get(&device_id).cloned())
    }

    async fn resolve_device_config(&self, device_id: Uuid) -> Result<Option<DeviceConfig>> {
        Ok(self.tables.read().await.device_configs.get(&device_id).cloned())
    }

    async fn upsert_capture_from_metadata(
        &self,
        device_id: Uuid,
        device_capture_id: &str,
        fields: &MetadataFields,
    ) -> Result<Uuid> {
        let mut t = self.tables.write().await;
        let key = (device_id, device_capture_id.to_string());
        if let Some(&id) = t.capture_by_key.get(&key) {
            let still_assembling = t
                .captures
                .get(&id)
                .map(|c| c.ingest_status == IngestStatus::Assembling)
                .unwrap_or(false);
            if still_assembling {
                let capture = t.captures.get_mut(&id).unwrap();
                capture.merge_metadata_sticky(fields);
                return Ok(id);
            }
        }
        let mut capture = Capture::new(device_id, device_capture_id.to_string());
        capture.merge_metadata_sticky(fields);
        let id = capture.id;
        t.captures.insert(id, capture);
        t.capture_by_key.insert(key, id);
        Ok(id)
    }

    async fn append_chunk(&self, _capture_id: Uuid, _chunk_id: u32, _bytes: &[u8]) -> Result<()> {
        // Chunk bytes are held by the in-memory Assembly itself (owned by
        // the assembly manager) until finalization; the façade's job here
        // is purely idempotence bookkeeping, which the caller already
        // guarantees via its bitmap. Nothing to do for the test double.
        Ok(())
    }

    async fn finalize_capture(
        &self,
        capture_id: Uuid,
        storage_path: &str,
        image_url: &str,
        sha256: &str,
        sensor_merge: &SensorData,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(capture) = t.captures.get_mut(&capture_id) {
            capture.ingest_status = IngestStatus::Success;
            capture.storage_path = Some(storage_path.to_string());
            capture.image_url = Some(image_url.to_string());
            capture.sha256 = Some(sha256.to_string());
            capture.sensor_data.merge_sticky(sensor_merge);
        }
        Ok(())
    }

    async fn fail_capture(&self, capture_id: Uuid, code: ErrorCode) -> Result<()> {
        {
            let mut t = self.tables.write().await;
            if let Some(capture) = t.captures.get_mut(&capture_id) {
                if capture.ingest_status == IngestStatus::Assembling {
                    capture.ingest_status = IngestStatus::Failed;
                }
            }
        }
        self.insert_error(None, Some(capture_id), code, code.as_str()).await
    }

    async fn update_next_wake(&self, device_id: Uuid, t: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(device) = tables.devices.get_mut(&device_id) {
            device.next_wake_at = Some(t);
        }
        Ok(())
    }

    async fn fetch_queued_commands(&self, limit: i64) -> Result<Vec<Command>> {
        let t = self.tables.read().await;
        let mut queued: Vec<Command> = t
            .commands
            .values()
            .filter(|c| c.status == CommandStatus::Queued)
            .cloned()
            .collect();
        queued.sort_by_key(|c| c.requested_at);
        queued.truncate(limit.max(0) as usize);
        Ok(queued)
    }

    async fn mark_command_sent(&self, command_id: Uuid, ts: DateTime<Utc>) -> Result<()> {
        let mut t = self.tables.write().await;
        if let Some(cmd) = t.commands.get_mut(&command_id) {
            if cmd.status == CommandStatus::Queued {
                cmd.status = CommandStatus::Sent;
                cmd.sent_at = Some(ts);
            }
        }
        Ok(())
    }

    async fn mark_command_acknowledged(&self, command_id: Uuid) -> Result<bool> {
        let mut t = self.tables.write().await;
        if let Some(cmd) = t.commands.get_mut(&command_id) {
            if cmd.status == CommandStatus::Sent {
                cmd.status = CommandStatus::Acknowledged;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn insert_command(
        &self,
        device_id: Uuid,
        command_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid> {
        let mut t = self.tables.write().await;
        let id = Uuid::new_v4();
        t.commands.insert(
            id,
            Command {
                id,
                device_id,
                command_type: command_type.to_string(),
                payload,
                status: CommandStatus::Queued,
                requested_at: Utc::now(),
                sent_at: None,
            },
        );
        Ok(id)
    }

    async fn insert_device_status(
        &self,
        _device_id: Uuid,
        _status: &str,
        _pending_img: Option<i64>,
    ) -> Result<()> {
        Ok(())
    }

    async fn insert_error(
        &self,
        device_id: Option<Uuid>,
        capture_id: Option<Uuid>,
        code: ErrorCode,
        message: &str,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        t.errors.push((device_id, capture_id, code, message.to_string()));
        Ok(())
    }

    async fn append_audit(
        &self,
        topic: &str,
        direction: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut t = self.tables.write().await;
        t.audit.push((topic.to_string(), direction.to_string(), payload.clone()));
        Ok(())
    }
}
