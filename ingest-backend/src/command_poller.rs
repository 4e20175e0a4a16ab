//! Command poller (§4.5): periodically drains queued operator commands and
//! publishes them to the device's command topic, committing `sent` only
//! after the publish succeeds — so a crash mid-tick leaves a command
//! `queued` for the next one rather than silently losing it. The tick shape
//! is a plain `tokio::time::interval` loop.

use std::sync::Arc;

use device_types::{DeviceAckMessage, DeviceHwId};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::config::AppConfig;
use crate::persistence::PersistenceFacade;
use crate::transport::Transport;

pub struct CommandPoller {
    config: Arc<AppConfig>,
    facade: Arc<dyn PersistenceFacade>,
    transport: Arc<dyn Transport>,
    audit: AuditLogger,
}

impl CommandPoller {
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

    pub async fn run(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.command_poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let commands = match self.facade.fetch_queued_commands(64).await {
            Ok(c) => c,
            Err(e) => {
                warn!("command_poller: failed to fetch queued commands: {e}");
                return;
            }
        };

        for command in commands {
            let device = match self.facade.resolve_device_by_id(command.device_id).await {
                Ok(Some(d)) => d,
                Ok(None) => {
                    warn!("command_poller: command {} targets unknown device", command.id);
                    continue;
                }
                Err(e) => {
                    warn!("command_poller: failed to resolve device for command {}: {e}", command.id);
                    continue;
                }
            };

            let topic = self.config.cmd_topic(device.hw_id.as_str());
            let Ok(payload_bytes) = serde_json::to_vec(&command.payload) else {
                warn!("command_poller: failed to serialize payload for command {}", command.id);
                continue;
            };
            if let Err(e) = self.transport.publish(&topic, payload_bytes).await {
                warn!("command_poller: publish failed for command {}: {e}, leaving queued", command.id);
                continue;
            }
            self.audit.log_outbound(&topic, &command.payload).await;

            let now = chrono::Utc::now();
            if let Err(e) = self.facade.mark_command_sent(command.id, now).await {
                warn!("command_poller: failed to mark command {} sent: {e}", command.id);
            }
        }
    }

    /// Device-ACK ingestion (§4.5 last paragraph): acks carrying a
    /// `command_id` transition the matching command to `acknowledged`;
    /// anything else is logged and dropped.
    pub async fn handle_device_ack(&self, hw_id: &DeviceHwId, ack: DeviceAckMessage) {
        let Some(command_id) = ack.command_id.as_deref() else {
            debug!("command_poller: ack from {hw_id} carries no command_id, dropping");
            return;
        };
        let Ok(id) = Uuid::parse_str(command_id) else {
            debug!("command_poller: ack from {hw_id} has unparseable command_id {command_id}");
            return;
        };
        match self.facade.mark_command_acknowledged(id).await {
            Ok(true) => {}
            Ok(false) => debug!("command_poller: ack from {hw_id} references unmatched command {id}"),
            Err(e) => warn!("command_poller: failed to mark command {id} acknowledged: {e}"),
        }
    }
}
