//! Audit logger: every inbound and outbound message, appended through the
//! persistence façade's `append_audit` primitive. §3 is explicit that this
//! log is "debugging only; not on any hot path's critical semantics" — so
//! this one does not SHA-256-chain blocks for tamper evidence: one append
//! primitive plus a handful of typed convenience wrappers is enough.

use std::sync::Arc;

use tracing::warn;

use crate::persistence::PersistenceFacade;

#[derive(Clone)]
pub struct AuditLogger {
    facade: Arc<dyn PersistenceFacade>,
}

impl AuditLogger {
    pub fn new(facade: Arc<dyn PersistenceFacade>) -> Self {
        Self { facade }
    }

    async fn append(&self, topic: &str, direction: &str, payload: &serde_json::Value) {
        if let Err(e) = self.facade.append_audit(topic, direction, payload).await {
            warn!("audit: failed to append {direction} record for {topic}: {e}");
        }
    }

    pub async fn log_inbound(&self, topic: &str, payload: &serde_json::Value) {
        self.append(topic, "in", payload).await;
    }

    pub async fn log_outbound(&self, topic: &str, payload: &serde_json::Value) {
        self.append(topic, "out", payload).await;
    }
}
