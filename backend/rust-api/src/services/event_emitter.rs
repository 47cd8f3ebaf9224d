use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use crate::metrics::OUTBOX_ENQUEUED_TOTAL;
use crate::models::attempt::Attempt;
use crate::models::event::EventEnvelope;
use crate::stores::OutboxStore;

/// Builds canonical envelopes and hands them to the outbox. Enqueueing is
/// the only delivery step the original caller ever awaits; publication is
/// fully asynchronous.
pub struct EventEmitter {
    outbox: Arc<dyn OutboxStore>,
}

impl EventEmitter {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }

    pub async fn attempt_finalized(&self, attempt: &Attempt) -> Result<()> {
        self.enqueue(EventEnvelope::attempt_finalized(attempt, Utc::now()))
            .await
    }

    pub async fn attempt_invalidated(&self, attempt: &Attempt) -> Result<()> {
        self.enqueue(EventEnvelope::attempt_invalidated(attempt, Utc::now()))
            .await
    }

    async fn enqueue(&self, envelope: EventEnvelope) -> Result<()> {
        let event_type = envelope.event_type.clone();
        let event_id = envelope.event_id.clone();
        let event = envelope.into_outbox_event(Utc::now());

        let inserted = self.outbox.enqueue(&event).await?;
        let outcome = if inserted { "inserted" } else { "duplicate" };
        OUTBOX_ENQUEUED_TOTAL
            .with_label_values(&[event_type.as_str(), outcome])
            .inc();
        tracing::debug!(event_id = %event_id, outcome = outcome, "Outbox enqueue");
        Ok(())
    }
}
