//! Handshake / scheduler (§4.4): on every status message, decide capture-now
//! vs sleep-until-T from the device's scheduling config and publish exactly
//! one outbound command. `next_wake_at` arithmetic uses `chrono`. The "write
//! then publish, never the reverse" ordering matters: it's what keeps a
//! persistence failure from ever causing a device to double-capture.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use device_types::{DeviceHwId, ServerCommand, StatusMessage};
use tracing::warn;

use crate::audit::AuditLogger;
use crate::config::AppConfig;
use crate::error::ErrorCode;
use crate::persistence::PersistenceFacade;
use crate::transport::Transport;

pub struct Handshake {
    config: Arc<AppConfig>,
    facade: Arc<dyn PersistenceFacade>,
    transport: Arc<dyn Transport>,
    audit: AuditLogger,
}

impl Handshake {
    pub fn new(
        config: Arc<AppConfig>,
        facade: Arc<dyn PersistenceFacade>,
        transport: Arc<dyn Transport>,
        audit: AuditLogger,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            facade,
            transport,
            audit,
        })
    }

    pub async fn handle_status(self: Arc<Self>, hw_id: &DeviceHwId, status: StatusMessage) {
        let device = match self.facade.resolve_device(hw_id).await {
            Ok(Some(d)) => d,
            Ok(None) => {
                warn!("handshake: status from unprovisioned device {hw_id} (UNKNOWN_DEVICE)");
                let _ = self
                    .facade
                    .insert_error(None, None, ErrorCode::UnknownDevice, "status from unprovisioned hw id")
                    .await;
                self.send_default_sleep(hw_id).await;
                return;
            }
            Err(e) => {
                warn!("handshake: failed to resolve device {hw_id}: {e}");
                return;
            }
        };

        let _ = self
            .facade
            .insert_device_status(device.id, &status.status, status.pending_img)
            .await;

        let config = match self.facade.resolve_device_config(device.id).await {
            Ok(Some(c)) => c,
            Ok(None) => {
                warn!("handshake: no scheduling config for {hw_id}, defaulting to sleep 12h");
                self.send_default_sleep(hw_id).await;
                return;
            }
            Err(e) => {
                warn!("handshake: failed to load config for {hw_id}: {e}");
                return;
            }
        };

        let interval = if config.test_mode {
            ChronoDuration::minutes(config.test_interval_minutes as i64)
        } else {
            ChronoDuration::hours(config.capture_interval_hours as i64)
        };

        let now = Utc::now();
        let due = match device.next_wake_at {
            Some(t) => now >= t,
            None => true,
        };

        if due {
            let next_wake = now + interval;
            // §4.4: the write and the command must be emitted together; if
            // persistence fails, the command is not sent (else the device
            // may double-capture).
            if let Err(e) = self.facade.update_next_wake(device.id, next_wake).await {
                warn!("handshake: failed to persist next_wake_at for {hw_id}, withholding command: {e}");
                return;
            }
            let cmd = ServerCommand::capture(hw_id);
            self.publish(hw_id, &cmd).await;
        } else {
            let next_wake = device.next_wake_at.unwrap_or(now);
            let cmd = ServerCommand::sleep_until(hw_id, format_iso8601_utc(next_wake));
            self.publish(hw_id, &cmd).await;
        }
    }

    async fn send_default_sleep(&self, hw_id: &DeviceHwId) {
        let next_wake = Utc::now() + ChronoDuration::hours(12);
        let cmd = ServerCommand::sleep_until(hw_id, format_iso8601_utc(next_wake));
        self.publish(hw_id, &cmd).await;
    }

    async fn publish(&self, hw_id: &DeviceHwId, cmd: &ServerCommand) {
        let topic = self.config.cmd_topic(hw_id.as_str());
        let Ok(payload) = serde_json::to_vec(cmd) else {
            return;
        };
        if self.transport.publish(&topic, payload).await.is_ok() {
            if let Ok(v) = serde_json::to_value(cmd) {
                self.audit.log_outbound(&topic, &v).await;
            }
        } else {
            warn!("handshake: failed to publish command to {hw_id}");
        }
    }
}

fn format_iso8601_utc(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;
    use crate::transport::InMemoryTransport;
    use crate::types::DeviceConfig;

    async fn setup() -> (Arc<Handshake>, InMemoryPersistence, InMemoryTransport, DeviceHwId) {
        let facade = InMemoryPersistence::new();
        let transport = InMemoryTransport::new();
        let config = Arc::new(AppConfig::from_env());
        let audit = AuditLogger::new(Arc::new(facade.clone()));
        let hw_id = DeviceHwId::parse("AABBCCDDEEFF").unwrap();
        let handshake = Handshake::new(
            config,
            Arc::new(facade.clone()),
            Arc::new(transport.clone()),
            audit,
        );
        (handshake, facade, transport, hw_id)
    }

    #[tokio::test]
    async fn due_device_gets_capture_command_and_updated_next_wake() {
        let (handshake, facade, transport, hw_id) = setup().await;
        facade
            .seed_device(
                hw_id.clone(),
                DeviceConfig {
                    test_mode: true,
                    test_interval_minutes: 5,
                    capture_interval_hours: 6,
                    wakeup_window_sec: 30,
                },
            )
            .await;

        handshake
            .handle_status(&hw_id, StatusMessage { device_id: hw_id.to_string(), status: "alive".into(), pending_img: Some(0) })
            .await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert_eq!(v["capture_image"], serde_json::json!(true));

        let device = facade.resolve_device(&hw_id).await.unwrap().unwrap();
        assert!(device.next_wake_at.is_some());
    }

    #[tokio::test]
    async fn not_due_device_gets_sleep_command_and_unchanged_next_wake() {
        let (handshake, facade, transport, hw_id) = setup().await;
        let device_id = facade
            .seed_device(
                hw_id.clone(),
                DeviceConfig {
                    test_mode: false,
                    test_interval_minutes: 5,
                    capture_interval_hours: 6,
                    wakeup_window_sec: 30,
                },
            )
            .await;
        let future = Utc::now() + ChronoDuration::minutes(2);
        facade.update_next_wake(device_id, future).await.unwrap();

        handshake
            .handle_status(&hw_id, StatusMessage { device_id: hw_id.to_string(), status: "alive".into(), pending_img: None })
            .await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert!(v.get("next_wake").is_some());

        let device = facade.resolve_device(&hw_id).await.unwrap().unwrap();
        assert_eq!(device.next_wake_at.unwrap(), future);
    }

    #[tokio::test]
    async fn unknown_device_gets_default_sleep() {
        let (handshake, _facade, transport, hw_id) = setup().await;
        handshake
            .handle_status(&hw_id, StatusMessage { device_id: hw_id.to_string(), status: "alive".into(), pending_img: None })
            .await;
        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        let v: serde_json::Value = serde_json::from_slice(&sent[0].payload).unwrap();
        assert!(v.get("next_wake").is_some());
    }
}
