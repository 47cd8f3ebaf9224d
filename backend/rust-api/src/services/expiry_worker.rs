use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::AttemptsConfig;
use crate::metrics::EXPIRY_WORKER_TICKS_TOTAL;
use crate::models::attempt::FinalizeTrigger;
use crate::services::attempt_service::AttemptService;
use crate::stores::DeadlineIndex;

/// Sweeps the deadline index and finalizes overdue attempts. Any number of
/// replicas can run this loop: the claim removes entries before processing
/// to avoid duplicate work, and the attempt store's conditional finalize
/// makes duplicates harmless anyway.
pub struct ExpiryWorker {
    deadlines: Arc<dyn DeadlineIndex>,
    attempts: Arc<AttemptService>,
    config: AttemptsConfig,
}

impl ExpiryWorker {
    pub fn new(
        deadlines: Arc<dyn DeadlineIndex>,
        attempts: Arc<AttemptService>,
        config: AttemptsConfig,
    ) -> Self {
        Self {
            deadlines,
            attempts,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.config.expiry_interval_secs.max(1));
        info!(
            "Starting expiry worker loop (interval {}s, batch {})",
            interval.as_secs(),
            self.config.expiry_batch_size
        );

        loop {
            match self.run_once(Utc::now()).await {
                Ok(finalized) => {
                    EXPIRY_WORKER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    if finalized > 0 {
                        info!(finalized, "Expiry worker tick completed");
                    }
                }
                Err(err) => {
                    EXPIRY_WORKER_TICKS_TOTAL.with_label_values(&["error"]).inc();
                    warn!(error = %err, "Expiry worker tick failed");
                }
            }

            sleep(interval).await;
        }
    }

    /// One sweep. Per-attempt failures are logged and skipped so one broken
    /// record cannot stall the rest of the batch.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<usize> {
        let due = self
            .deadlines
            .claim_due(now, self.config.expiry_batch_size)
            .await?;

        let mut finalized = 0;
        for attempt_id in &due {
            match self
                .attempts
                .finalize(attempt_id, FinalizeTrigger::Expiry)
                .await
            {
                Ok(_) => finalized += 1,
                Err(err) => {
                    warn!(attempt_id = %attempt_id, error = %err, "Failed to finalize expired attempt");
                }
            }
        }

        Ok(finalized)
    }
}
