//! Assembly manager (§4.2): one state machine per `(device, image_name)`,
//! owned exclusively by that device's serial worker. The lookup map from
//! hw_id to worker channel uses a coarse `RwLock<HashMap<..>>` — exactly
//! what §5 prescribes — with one `tokio::spawn`ed consumer loop per entry,
//! each mutating only its own state and never another device's.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use device_types::{ChunkMessage, DeviceHwId, ImageMetadataMessage, ServerNack};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::blobstore::BlobStore;
use crate::config::AppConfig;
use crate::error::ErrorCode;
use crate::finalizer::{self, FinalizeOutcome, FinalizerContext};
use crate::persistence::PersistenceFacade;
use crate::ratelimit::RateLimiter;
use crate::transport::Transport;
use crate::types::MetadataFields;

/// In-memory twin of a `Capture` still in the `assembling` state. Owned
/// exclusively by one `DeviceWorker`; never shared, never locked.
pub struct Assembly {
    pub capture_id: Uuid,
    pub image_name: String,
    pub declared_size: Option<u64>,
    pub total_chunk_count: Option<u32>,
    pub declared_sha256: Option<String>,
    pub received: HashSet<u32>,
    pub chunks: HashMap<u32, Vec<u8>>,
    pub bytes_buffered: u64,
    pub created_at: Instant,
    pub last_activity: Instant,
    pub retransmit_attempts: u32,
    pub chunks_since_last_tick: bool,
    retransmit_task: Option<JoinHandle<()>>,
}

impl Assembly {
    fn new(capture_id: Uuid) -> Self {
        let now = Instant::now();
        Self {
            capture_id,
            image_name: String::new(),
            declared_size: None,
            total_chunk_count: None,
            declared_sha256: None,
            received: HashSet::new(),
            chunks: HashMap::new(),
            bytes_buffered: 0,
            created_at: now,
            last_activity: now,
            retransmit_attempts: 0,
            chunks_since_last_tick: false,
            retransmit_task: None,
        }
    }

    /// Completion fires only when the count is known, the bitmap is full,
    /// and chunk 0 / chunk N-1 are both present (§4.2) — the last check is
    /// redundant with "bitmap full" but kept explicit because it's the
    /// literal acceptance criterion §8 tests against.
    fn is_complete(&self) -> bool {
        match self.total_chunk_count {
            Some(n) if n > 0 => {
                self.received.len() as u32 == n
                    && self.received.contains(&0)
                    && self.received.contains(&(n - 1))
            }
            _ => false,
        }
    }

    fn missing_chunks(&self) -> Vec<u32> {
        match self.total_chunk_count {
            Some(n) => (0..n).filter(|id| !self.received.contains(id)).collect(),
            None => Vec::new(),
        }
    }
}

impl Drop for Assembly {
    fn drop(&mut self) {
        if let Some(handle) = self.retransmit_task.take() {
            handle.abort();
        }
    }
}

enum DeviceEvent {
    Metadata(ImageMetadataMessage),
    Chunk(ChunkMessage),
    RetransmitTick(String),
    ReapCheck,
}

struct WorkerCtx {
    hw_id: DeviceHwId,
    config: Arc<AppConfig>,
    facade: Arc<dyn PersistenceFacade>,
    finalizer: Arc<FinalizerContext>,
    audit: AuditLogger,
    transport: Arc<dyn Transport>,
    global_assemblies: Arc<AtomicUsize>,
    overload_limiter: Arc<RateLimiter<DeviceHwId>>,
}

pub struct AssemblyManager {
    config: Arc<AppConfig>,
    facade: Arc<dyn PersistenceFacade>,
    finalizer_ctx: Arc<FinalizerContext>,
    audit: AuditLogger,
    transport: Arc<dyn Transport>,
    device_channels: RwLock<HashMap<DeviceHwId, mpsc::Sender<DeviceEventMsg>>>,
    global_assemblies: Arc<AtomicUsize>,
    backpressure_limiter: RateLimiter<DeviceHwId>,
    overload_limiter: Arc<RateLimiter<DeviceHwId>>,
}

/// Wrapper so the manager's public channel type doesn't leak the private
/// `DeviceEvent` enum.
struct DeviceEventMsg(DeviceEvent);

impl AssemblyManager {
    pub fn new(
        config: Arc<AppConfig>,
        facade: Arc<dyn PersistenceFacade>,
        blob_store: Arc<dyn BlobStore>,
        transport: Arc<dyn Transport>,
        audit: AuditLogger,
    ) -> Arc<Self> {
        let finalizer_ctx = Arc::new(FinalizerContext {
            config: config.clone(),
            facade: facade.clone(),
            blob_store,
            transport: transport.clone(),
            audit: audit.clone(),
        });
        Arc::new(Self {
            config,
            facade,
            finalizer_ctx,
            audit,
            transport,
            device_channels: RwLock::new(HashMap::new()),
            global_assemblies: Arc::new(AtomicUsize::new(0)),
            backpressure_limiter: RateLimiter::new(Duration::from_secs(60)),
            overload_limiter: Arc::new(RateLimiter::new(Duration::from_secs(60))),
        })
    }

    async fn channel_for(&self, hw_id: &DeviceHwId) -> mpsc::Sender<DeviceEventMsg> {
        if let Some(tx) = self.device_channels.read().await.get(hw_id) {
            return tx.clone();
        }
        let mut channels = self.device_channels.write().await;
        if let Some(tx) = channels.get(hw_id) {
            return tx.clone();
        }
        let (tx, rx) = mpsc::channel(256);
        let ctx = WorkerCtx {
            hw_id: hw_id.clone(),
            config: self.config.clone(),
            facade: self.facade.clone(),
            finalizer: self.finalizer_ctx.clone(),
            audit: self.audit.clone(),
            transport: self.transport.clone(),
            global_assemblies: self.global_assemblies.clone(),
            overload_limiter: self.overload_limiter.clone(),
        };
        let self_tx = tx.clone();
        tokio::spawn(run_device_worker(ctx, rx, self_tx));
        channels.insert(hw_id.clone(), tx.clone());
        tx
    }

    /// Router entry point for the `data` topic. Applies the per-device
    /// bounded-queue backpressure rule: if the device's inbox is full, the
    /// message is dropped and `BACKPRESSURE_DROP` is emitted at most once
    /// per device per minute.
    pub async fn dispatch_metadata(&self, hw_id: &DeviceHwId, msg: ImageMetadataMessage) {
        let tx = self.channel_for(hw_id).await;
        if tx.try_send(DeviceEventMsg(DeviceEvent::Metadata(msg))).is_err() {
            self.note_backpressure(hw_id).await;
        }
    }

    pub async fn dispatch_chunk(&self, hw_id: &DeviceHwId, msg: ChunkMessage) {
        let tx = self.channel_for(hw_id).await;
        if tx.try_send(DeviceEventMsg(DeviceEvent::Chunk(msg))).is_err() {
            self.note_backpressure(hw_id).await;
        }
    }

    async fn note_backpressure(&self, hw_id: &DeviceHwId) {
        if self.backpressure_limiter.should_emit(hw_id.clone()).await {
            warn!("assembly: device {hw_id} queue full, dropping message (BACKPRESSURE_DROP)");
            let _ = self
                .facade
                .insert_error(None, None, ErrorCode::BackpressureDrop, "per-device inbox full")
                .await;
        }
    }

    /// Reaper entry point (§4.2 "Reaper"): fan out a reap check to every
    /// device worker currently tracked. Never mutates assemblies directly —
    /// always goes through the owning worker's queue, per the design note
    /// that the reaper must act via the worker, never the timer thread.
    pub async fn tick_reaper(&self) {
        let channels: Vec<mpsc::Sender<DeviceEventMsg>> =
            self.device_channels.read().await.values().cloned().collect();
        for tx in channels {
            let _ = tx.try_send(DeviceEventMsg(DeviceEvent::ReapCheck));
        }
    }
}

async fn run_device_worker(
    ctx: WorkerCtx,
    mut rx: mpsc::Receiver<DeviceEventMsg>,
    self_tx: mpsc::Sender<DeviceEventMsg>,
) {
    let mut assemblies: HashMap<String, Assembly> = HashMap::new();

    let device = match ctx.facade.resolve_device(&ctx.hw_id).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            warn!("assembly: unknown device {} seen on data topic", ctx.hw_id);
            let _ = ctx
                .facade
                .insert_error(None, None, ErrorCode::UnknownDevice, "data from unprovisioned device")
                .await;
            return;
        }
        Err(e) => {
            warn!("assembly: failed to resolve device {}: {e}", ctx.hw_id);
            return;
        }
    };

    while let Some(DeviceEventMsg(event)) = rx.recv().await {
        match event {
            DeviceEvent::Metadata(msg) => {
                handle_metadata(&ctx, device.id, &mut assemblies, msg, &self_tx).await;
            }
            DeviceEvent::Chunk(msg) => {
                handle_chunk(&ctx, device.id, &mut assemblies, msg, &self_tx).await;
            }
            DeviceEvent::RetransmitTick(image_name) => {
                handle_retransmit_tick(&ctx, &mut assemblies, &image_name).await;
            }
            DeviceEvent::ReapCheck => {
                handle_reap(&ctx, &mut assemblies).await;
            }
        }
    }
}

fn spawn_retransmit_timer(
    ctx: &WorkerCtx,
    image_name: String,
    self_tx: &mpsc::Sender<DeviceEventMsg>,
) -> JoinHandle<()> {
    let delay = ctx.config.retransmit_delay;
    let tx = self_tx.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(delay).await;
            if tx
                .send(DeviceEventMsg(DeviceEvent::RetransmitTick(image_name.clone())))
                .await
                .is_err()
            {
                return;
            }
        }
    })
}

async fn get_or_create<'a>(
    ctx: &WorkerCtx,
    device_id: Uuid,
    assemblies: &'a mut HashMap<String, Assembly>,
    image_name: &str,
    self_tx: &mpsc::Sender<DeviceEventMsg>,
) -> Option<&'a mut Assembly> {
    if assemblies.contains_key(image_name) {
        return assemblies.get_mut(image_name);
    }

    if assemblies.len() >= ctx.config.max_assemblies_per_device
        || ctx.global_assemblies.load(Ordering::Relaxed) >= ctx.config.max_assemblies_global
    {
        if ctx.overload_limiter.should_emit(ctx.hw_id.clone()).await {
            warn!("assembly: {} at capacity, rejecting {image_name} (OVERLOAD)", ctx.hw_id);
            let _ = ctx
                .facade
                .insert_error(None, None, ErrorCode::Overload, "assembly capacity exceeded")
                .await;
        }
        return None;
    }

    let capture_id = match ctx
        .facade
        .upsert_capture_from_metadata(device_id, image_name, &MetadataFields::default())
        .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("assembly: failed to create capture row for {image_name}: {e}");
            return None;
        }
    };

    let mut assembly = Assembly::new(capture_id);
    assembly.image_name = image_name.to_string();
    assembly.retransmit_task = Some(spawn_retransmit_timer(ctx, image_name.to_string(), self_tx));
    ctx.global_assemblies.fetch_add(1, Ordering::Relaxed);
    assemblies.insert(image_name.to_string(), assembly);
    assemblies.get_mut(image_name)
}

async fn handle_metadata(
    ctx: &WorkerCtx,
    device_id: Uuid,
    assemblies: &mut HashMap<String, Assembly>,
    msg: ImageMetadataMessage,
    self_tx: &mpsc::Sender<DeviceEventMsg>,
) {
    let fields = MetadataFields {
        declared_size: msg.image_size,
        total_chunk_count: msg.total_chunk_count,
        max_chunk_size: msg.max_chunks_size,
        captured_at: msg
            .capture_timestamp
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        sha256: msg.sha256.clone(),
        sensor_data: crate::types::SensorData {
            temperature_c: msg.temperature,
            humidity_pct: msg.humidity,
            pressure_hpa: msg.pressure,
            gas_kohm: msg.gas_resistance,
            extra: Default::default(),
        },
    };

    if let Err(e) = ctx
        .facade
        .upsert_capture_from_metadata(device_id, &msg.image_name, &fields)
        .await
    {
        warn!("assembly: metadata upsert failed for {}: {e}", msg.image_name);
        return;
    }

    let image_name = msg.image_name.clone();
    let Some(assembly) = get_or_create(ctx, device_id, assemblies, &image_name, self_tx).await
    else {
        return;
    };

    if assembly.total_chunk_count.is_none() {
        assembly.total_chunk_count = msg.total_chunk_count;
    }
    if assembly.declared_size.is_none() {
        assembly.declared_size = msg.image_size;
    }
    if assembly.declared_sha256.is_none() {
        assembly.declared_sha256 = msg.sha256;
    }
    assembly.last_activity = Instant::now();

    maybe_finalize(ctx, assemblies, &image_name).await;
}

async fn handle_chunk(
    ctx: &WorkerCtx,
    device_id: Uuid,
    assemblies: &mut HashMap<String, Assembly>,
    msg: ChunkMessage,
    self_tx: &mpsc::Sender<DeviceEventMsg>,
) {
    let bytes = match base64::engine::general_purpose::STANDARD.decode(&msg.payload) {
        Ok(b) => b,
        Err(_) => {
            debug!("assembly: chunk {} decode failure on {}", msg.chunk_id, msg.image_name);
            let _ = ctx
                .facade
                .insert_error(None, None, ErrorCode::ChunkDecodeFail, "base64 decode failed")
                .await;
            return;
        }
    };

    let image_name = msg.image_name.clone();
    let Some(assembly) = get_or_create(ctx, device_id, assemblies, &image_name, self_tx).await
    else {
        return;
    };

    if let Some(total) = assembly.total_chunk_count {
        if msg.chunk_id >= total {
            warn!("assembly: chunk {} out of range for {image_name} (total={total})", msg.chunk_id);
            let _ = ctx
                .facade
                .insert_error(None, None, ErrorCode::ChunkOutOfRange, "chunk_id >= total_chunk_count")
                .await;
            return;
        }
    }

    if assembly.received.contains(&msg.chunk_id) {
        if assembly.chunks.get(&msg.chunk_id).map(|b| b.as_slice()) != Some(bytes.as_slice()) {
            warn!("assembly: chunk {} conflict on {image_name}", msg.chunk_id);
            let _ = ctx
                .facade
                .insert_error(
                    None,
                    Some(assembly.capture_id),
                    ErrorCode::DupChunkConflict,
                    "re-submitted chunk differs from journaled bytes",
                )
                .await;
        }
        // Identical re-submission: silent no-op either way (§4.2).
        return;
    }

    if assembly.bytes_buffered + bytes.len() as u64 > ctx.config.max_image_bytes {
        warn!("assembly: {image_name} would exceed MAX_IMAGE_BYTES, rejecting chunk {}", msg.chunk_id);
        let _ = ctx
            .facade
            .insert_error(None, Some(assembly.capture_id), ErrorCode::Oversized, "buffer would exceed MAX_IMAGE_BYTES")
            .await;
        return;
    }

    if let Err(e) = ctx
        .facade
        .append_chunk(assembly.capture_id, msg.chunk_id, &bytes)
        .await
    {
        warn!("assembly: failed to journal chunk {}: {e}", msg.chunk_id);
        return;
    }

    assembly.bytes_buffered += bytes.len() as u64;
    assembly.chunks.insert(msg.chunk_id, bytes);
    assembly.received.insert(msg.chunk_id);
    assembly.chunks_since_last_tick = true;
    assembly.last_activity = Instant::now();

    maybe_finalize(ctx, assemblies, &image_name).await;
}

async fn maybe_finalize(ctx: &WorkerCtx, assemblies: &mut HashMap<String, Assembly>, image_name: &str) {
    let complete = assemblies.get(image_name).map(|a| a.is_complete()).unwrap_or(false);
    if !complete {
        return;
    }

    let assembly = assemblies.get(image_name).unwrap();
    let outcome = finalizer::finalize(&ctx.finalizer, &ctx.hw_id, assembly.capture_id, assembly).await;

    match outcome {
        FinalizeOutcome::Success | FinalizeOutcome::TerminalFailure(_) => {
            assemblies.remove(image_name);
            ctx.global_assemblies.fetch_sub(1, Ordering::Relaxed);
        }
        FinalizeOutcome::Retryable(_) => {
            // Left in place: the next completion trigger (harmless, since
            // the bitmap is already full) or the reaper will take it from here.
        }
    }
}

async fn handle_retransmit_tick(ctx: &WorkerCtx, assemblies: &mut HashMap<String, Assembly>, image_name: &str) {
    let Some(assembly) = assemblies.get_mut(image_name) else {
        return; // already finalized, failed, or reaped
    };
    if assembly.is_complete() {
        return;
    }
    let Some(_total) = assembly.total_chunk_count else {
        return; // can't compute missing chunks without the declared count
    };

    if assembly.chunks_since_last_tick {
        assembly.retransmit_attempts = 0;
    } else {
        assembly.retransmit_attempts += 1;
    }
    assembly.chunks_since_last_tick = false;

    if assembly.retransmit_attempts > ctx.config.retransmit_max {
        warn!("assembly: {} exhausted retransmit budget for {image_name}", ctx.hw_id);
        let capture_id = assembly.capture_id;
        assemblies.remove(image_name);
        ctx.global_assemblies.fetch_sub(1, Ordering::Relaxed);
        let _ = ctx
            .facade
            .fail_capture(capture_id, ErrorCode::AssemblyRetransmitExhausted)
            .await;
        return;
    }

    let missing = assembly.missing_chunks();
    if missing.is_empty() {
        return;
    }

    let nack = ServerNack {
        image_name: image_name.to_string(),
        missing_chunks: missing,
    };
    let topic = ctx.config.ack_topic(ctx.hw_id.as_str());
    if let Ok(payload) = serde_json::to_vec(&nack) {
        if ctx.transport.publish(&topic, payload).await.is_ok() {
            if let Ok(v) = serde_json::to_value(&nack) {
                ctx.audit.log_outbound(&topic, &v).await;
            }
        }
    }
}

async fn handle_reap(ctx: &WorkerCtx, assemblies: &mut HashMap<String, Assembly>) {
    let now = Instant::now();
    let timed_out: Vec<String> = assemblies
        .iter()
        .filter(|(_, a)| now.duration_since(a.last_activity) > ctx.config.capture_timeout)
        .map(|(name, _)| name.clone())
        .collect();

    for name in timed_out {
        if let Some(assembly) = assemblies.remove(&name) {
            ctx.global_assemblies.fetch_sub(1, Ordering::Relaxed);
            info!("reaper: {} aged out assembly {name}", ctx.hw_id);
            let _ = ctx
                .facade
                .fail_capture(assembly.capture_id, ErrorCode::AssemblyTimeout)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assembly_with(total: u32, received: &[u32]) -> Assembly {
        let mut a = Assembly::new(Uuid::new_v4());
        a.total_chunk_count = Some(total);
        for id in received {
            a.received.insert(*id);
        }
        a
    }

    #[test]
    fn complete_requires_full_bitmap_and_both_ends() {
        assert!(assembly_with(3, &[0, 1, 2]).is_complete());
        assert!(!assembly_with(3, &[1, 2]).is_complete());
    }

    #[test]
    fn missing_chunks_lists_unset_bits_only() {
        let a = assembly_with(4, &[0, 2]);
        assert_eq!(a.missing_chunks(), vec![1, 3]);
    }
}
