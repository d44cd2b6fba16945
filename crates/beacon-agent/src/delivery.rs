use std::sync::Arc;

use beacon_core::{ItemKey, Payload, Reading, TelemetryEvent};
use beacon_store::StoreError;

use crate::sync::SyncEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Delivered directly; nothing was queued.
    Sent,
    /// Persisted for a later drain.
    Queued(ItemKey),
}

/// Hands telemetry to the sink, falling back to the durable queue.
pub struct Delivery {
    engine: Arc<SyncEngine>,
}

impl Delivery {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn submit(&self, reading: Reading) -> Result<SubmitOutcome, StoreError> {
        self.submit_payload(Payload::Reading(reading)).await
    }

    pub async fn submit_event(&self, event: TelemetryEvent) -> Result<SubmitOutcome, StoreError> {
        self.submit_payload(Payload::Event(event)).await
    }

    /// Online: try a direct send first. Offline, or when the send fails, the
    /// payload is enqueued before this returns.
    pub async fn submit_payload(&self, payload: Payload) -> Result<SubmitOutcome, StoreError> {
        if self.engine.connectivity().check() {
            match self.engine.transport().send(&payload).await {
                Ok(()) => {
                    tracing::debug!(origin_id = %payload.origin_id(), "sent directly");
                    return Ok(SubmitOutcome::Sent);
                }
                Err(e) => {
                    tracing::warn!(origin_id = %payload.origin_id(), "direct send failed, queueing: {e}");
                }
            }
        }

        self.persist(&payload).await.map(SubmitOutcome::Queued)
    }

    /// Queue without touching the sink. Enqueue is idempotent on the origin
    /// id, so persisting a payload that is already queued is harmless.
    pub async fn persist(&self, payload: &Payload) -> Result<ItemKey, StoreError> {
        let key = self.engine.store().lock().await.enqueue(payload)?;
        tracing::debug!(item = %key, "queued for later delivery");
        if let Err(e) = self.engine.refresh_pending().await {
            tracing::warn!("failed to refresh pending count: {e}");
        }
        Ok(key)
    }
}
