//! Finalizer (§4.3): the nine-step completion pipeline. Steps 1–4 are pure
//! functions, unit-tested without any I/O, kept separate from the async
//! steps that do. Steps 5–8 go through `BlobStore` and
//! `PersistenceFacade`; anything that fails from step 5 onward leaves the
//! Capture row untouched (`assembling`), per §4.3's recoverability rule.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use device_types::{AckOkBody, DeviceHwId, ServerAckOk};
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use uuid::Uuid;

use crate::assembly::Assembly;
use crate::audit::AuditLogger;
use crate::blobstore::{capture_path, BlobStore};
use crate::config::AppConfig;
use crate::error::ErrorCode;
use crate::persistence::PersistenceFacade;
use crate::transport::Transport;
use crate::types::SensorData;

/// Outcome of a finalize attempt, used by the assembly manager to decide
/// whether to drop the in-memory assembly or leave it for a retry / reap.
pub enum FinalizeOutcome {
    Success,
    /// Steps 1–4 failed in a way that can never succeed on retry — the
    /// capture is marked `failed` and the assembly is released.
    TerminalFailure(ErrorCode),
    /// Step 5 or later failed; the capture stays `assembling` and the
    /// assembly is kept so the next completion trigger (or the reaper)
    /// can take another pass.
    Retryable(ErrorCode),
}

/// Step 1: concatenate chunk payloads in ascending `chunk_id` order.
/// Pure, no I/O — panics only if called with a gap, which the caller
/// (the completion check) already guarantees cannot happen.
pub fn concat_chunks(total_chunk_count: u32, chunks: &std::collections::HashMap<u32, Vec<u8>>) -> Vec<u8> {
    let mut buf = Vec::new();
    for id in 0..total_chunk_count {
        if let Some(bytes) = chunks.get(&id) {
            buf.extend_from_slice(bytes);
        }
    }
    buf
}

/// Step 2: declared vs actual size. This spec resolves the open question
/// in favor of strict equality (DESIGN.md "SIZE_MISMATCH") — a mismatch is
/// terminal rather than a warn-and-proceed.
pub fn verify_size(buf: &[u8], declared_size: Option<u64>) -> bool {
    match declared_size {
        Some(declared) => buf.len() as u64 == declared,
        None => true,
    }
}

/// Step 3: JPEG SOI/EOI framing.
pub fn verify_jpeg_framing(buf: &[u8]) -> bool {
    buf.len() >= 4
        && buf[0] == 0xFF
        && buf[1] == 0xD8
        && buf[buf.len() - 2] == 0xFF
        && buf[buf.len() - 1] == 0xD9
}

/// Step 4: SHA-256 over the actual buffer bytes — computed after assembly,
/// never before, which is the empty-string-hash bug §9 calls out in the
/// reference implementation.
pub fn sha256_of(buf: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(buf);
    hex::encode(hasher.finalize())
}

pub struct FinalizerContext {
    pub config: Arc<AppConfig>,
    pub facade: Arc<dyn PersistenceFacade>,
    pub blob_store: Arc<dyn BlobStore>,
    pub transport: Arc<dyn Transport>,
    pub audit: AuditLogger,
}

pub async fn finalize(
    ctx: &FinalizerContext,
    hw_id: &DeviceHwId,
    capture_id: Uuid,
    assembly: &Assembly,
) -> FinalizeOutcome {
    let total = match assembly.total_chunk_count {
        Some(n) => n,
        None => return FinalizeOutcome::Retryable(ErrorCode::AssemblyTimeout),
    };

    // Steps 1–4: pure, no I/O.
    let buf = concat_chunks(total, &assembly.chunks);

    if !verify_size(&buf, assembly.declared_size) {
        warn!(
            "finalizer[{hw_id}/{}]: size mismatch, declared={:?} actual={}",
            assembly.image_name,
            assembly.declared_size,
            buf.len()
        );
        let _ = ctx
            .facade
            .fail_capture(capture_id, ErrorCode::SizeMismatch)
            .await;
        return FinalizeOutcome::TerminalFailure(ErrorCode::SizeMismatch);
    }

    if !verify_jpeg_framing(&buf) {
        warn!("finalizer[{hw_id}/{}]: invalid JPEG framing", assembly.image_name);
        let _ = ctx.facade.fail_capture(capture_id, ErrorCode::JpegInvalid).await;
        return FinalizeOutcome::TerminalFailure(ErrorCode::JpegInvalid);
    }

    let computed_sha = sha256_of(&buf);
    if let Some(declared_sha) = &assembly.declared_sha256 {
        if declared_sha != &computed_sha {
            warn!("finalizer[{hw_id}/{}]: sha256 mismatch", assembly.image_name);
            let _ = ctx.facade.fail_capture(capture_id, ErrorCode::HashMismatch).await;
            return FinalizeOutcome::TerminalFailure(ErrorCode::HashMismatch);
        }
    }

    // Step 5: upload. Path is deterministic, so a retry after a prior
    // partial failure just overwrites the same object.
    let path = capture_path(hw_id.as_str(), &assembly.image_name);
    if let Err(e) = ctx.blob_store.put(&path, &buf, "image/jpeg").await {
        warn!("finalizer[{hw_id}/{}]: upload failed: {e}", assembly.image_name);
        let _ = ctx
            .facade
            .insert_error(None, Some(capture_id), ErrorCode::StorageUploadFail, &e.to_string())
            .await;
        return FinalizeOutcome::Retryable(ErrorCode::StorageUploadFail);
    }

    // Step 6: resolve the public URL.
    let url = ctx.blob_store.public_url(&path);

    // Step 7: atomic record update.
    let next_wake = Utc::now() + ChronoDuration::hours(12);
    if let Err(e) = ctx
        .facade
        .finalize_capture(capture_id, &path, &url, &computed_sha, &SensorData::default())
        .await
    {
        warn!("finalizer[{hw_id}/{}]: record update failed: {e}", assembly.image_name);
        let _ = ctx
            .facade
            .insert_error(None, Some(capture_id), ErrorCode::CaptureUpdateFail, &e.to_string())
            .await;
        return FinalizeOutcome::Retryable(ErrorCode::CaptureUpdateFail);
    }

    // Step 8: device ACK.
    let ack = ServerAckOk {
        image_name: assembly.image_name.clone(),
        ack_ok: AckOkBody {
            next_wake_time: next_wake.to_rfc3339(),
        },
    };
    let ack_topic = ctx.config.ack_topic(hw_id.as_str());
    if let Ok(payload) = serde_json::to_vec(&ack) {
        if let Err(e) = ctx.transport.publish(&ack_topic, payload.clone()).await {
            warn!("finalizer[{hw_id}/{}]: failed to publish ACK_OK: {e}", assembly.image_name);
        } else if let Ok(v) = serde_json::to_value(&ack) {
            ctx.audit.log_outbound(&ack_topic, &v).await;
        }
    }

    info!(
        "finalizer[{hw_id}/{}]: success, {} bytes at {path}",
        assembly.image_name,
        buf.len()
    );

    // Step 9 (release the assembly) is the caller's responsibility.
    FinalizeOutcome::Success
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chunks(parts: &[&[u8]]) -> HashMap<u32, Vec<u8>> {
        parts
            .iter()
            .enumerate()
            .map(|(i, p)| (i as u32, p.to_vec()))
            .collect()
    }

    #[test]
    fn concat_orders_by_chunk_id_not_insertion_order() {
        let mut map = HashMap::new();
        map.insert(1u32, vec![0xFF, 0xD9]);
        map.insert(0u32, vec![0xFF, 0xD8]);
        let buf = concat_chunks(2, &map);
        assert_eq!(buf, vec![0xFF, 0xD8, 0xFF, 0xD9]);
    }

    #[test]
    fn verify_size_requires_exact_match_when_declared() {
        let buf = vec![1, 2, 3, 4];
        assert!(verify_size(&buf, Some(4)));
        assert!(!verify_size(&buf, Some(5)));
        assert!(verify_size(&buf, None));
    }

    #[test]
    fn jpeg_framing_checks_first_two_and_last_two_bytes() {
        assert!(verify_jpeg_framing(&[0xFF, 0xD8, 0x00, 0xFF, 0xD9]));
        assert!(!verify_jpeg_framing(&[0x00, 0x01, 0x02, 0x03]));
        assert!(!verify_jpeg_framing(&[0xFF, 0xD8]));
    }

    #[test]
    fn sha256_is_computed_from_the_actual_buffer() {
        let buf = concat_chunks(2, &chunks(&[&[0xFF, 0xD8], &[0xFF, 0xD9]]));
        let got = sha256_of(&buf);
        let expected = sha256_of(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert_eq!(got, expected);
        assert_ne!(got, sha256_of(b""));
    }
}
