//! Admin HTTP surface (SPEC_FULL §6 AMBIENT): `GET /health` for container
//! platform liveness checks and `POST /admin/commands` for operator command
//! injection — the HTTP front door for the Command entity's "created
//! externally (operator)" half that spec.md leaves as an outside actor.
//! Shape follows the usual container-platform health-check convention:
//! a tiny unauthenticated JSON status endpoint plus a narrow operator surface.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use device_types::{DeviceHwId, OperatorCommandRequest};
use serde_json::json;
use tracing::warn;

use crate::persistence::PersistenceFacade;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

pub fn record_startup() {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    STARTUP_MS.store(now, Ordering::Relaxed);
}

#[derive(Clone)]
struct AdminState {
    facade: Arc<dyn PersistenceFacade>,
}

pub fn router(facade: Arc<dyn PersistenceFacade>) -> Router {
    let state = AdminState { facade };
    Router::new()
        .route("/health", get(health_check))
        .route("/admin/commands", post(create_command))
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    let startup = STARTUP_MS.load(Ordering::Relaxed);
    let uptime_secs = if startup > 0 { (now_ms - startup) / 1000 } else { 0 };
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

async fn create_command(
    State(state): State<AdminState>,
    Json(req): Json<OperatorCommandRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let Some(hw_id) = DeviceHwId::parse(&req.device_id) else {
        return Err(StatusCode::BAD_REQUEST);
    };
    let device = state
        .facade
        .resolve_device(&hw_id)
        .await
        .map_err(|e| {
            warn!("admin: failed to resolve device {hw_id}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .ok_or(StatusCode::NOT_FOUND)?;

    let command_id = state
        .facade
        .insert_command(device.id, &req.command_type, req.payload)
        .await
        .map_err(|e| {
            warn!("admin: failed to queue command for {hw_id}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(json!({ "command_id": command_id })))
}
