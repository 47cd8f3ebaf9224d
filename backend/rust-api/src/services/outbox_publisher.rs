use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, PublishError};
use crate::config::OutboxConfig;
use crate::metrics::{
    OUTBOX_LEASES_RECLAIMED_TOTAL, OUTBOX_PUBLISHER_TICKS_TOTAL, OUTBOX_PUBLISHES_TOTAL,
};
use crate::stores::OutboxStore;

#[derive(Debug, Default, PartialEq)]
pub struct TickSummary {
    pub reclaimed: u64,
    pub published: usize,
    pub retried: usize,
    pub dead: usize,
    pub lease_lost: usize,
}

/// Drains pending outbox rows to the broker. Stateless: any number of
/// replicas can tick concurrently, the pending -> publishing lease is the
/// only mutual exclusion between them.
pub struct OutboxPublisher {
    outbox: Arc<dyn OutboxStore>,
    broker: Arc<dyn BrokerClient>,
    config: OutboxConfig,
}

impl OutboxPublisher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        broker: Arc<dyn BrokerClient>,
        config: OutboxConfig,
    ) -> Self {
        Self {
            outbox,
            broker,
            config,
        }
    }

    pub async fn run(&self) -> Result<()> {
        let interval = StdDuration::from_secs(self.config.publish_interval_secs.max(1));
        info!(
            "Starting outbox publisher loop (interval {}s, batch {})",
            interval.as_secs(),
            self.config.publish_batch_size
        );

        loop {
            match self.run_once(Utc::now()).await {
                Ok(summary) => {
                    OUTBOX_PUBLISHER_TICKS_TOTAL
                        .with_label_values(&["success"])
                        .inc();
                    if summary.published + summary.retried + summary.dead > 0 {
                        info!(
                            published = summary.published,
                            retried = summary.retried,
                            dead = summary.dead,
                            "Outbox publisher tick completed"
                        );
                    }
                }
                Err(err) => {
                    OUTBOX_PUBLISHER_TICKS_TOTAL
                        .with_label_values(&["error"])
                        .inc();
                    warn!(error = %err, "Outbox publisher tick failed");
                }
            }

            sleep(interval).await;
        }
    }

    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let mut summary = TickSummary::default();

        // Crash recovery before selection, so a publisher that died mid-send
        // never strands its leases longer than the threshold.
        let stale_cutoff = now - Duration::seconds(self.config.stale_lease_secs.max(1));
        summary.reclaimed = self.outbox.reclaim_stale(stale_cutoff, now).await?;
        if summary.reclaimed > 0 {
            OUTBOX_LEASES_RECLAIMED_TOTAL.inc_by(summary.reclaimed);
            warn!(
                reclaimed = summary.reclaimed,
                "Reclaimed stale publishing leases"
            );
        }

        let batch = self
            .outbox
            .fetch_pending(now, self.config.publish_batch_size)
            .await?;

        for event in batch {
            if !self.outbox.lease(&event.id, now).await? {
                summary.lease_lost += 1;
                OUTBOX_PUBLISHES_TOTAL
                    .with_label_values(&["lease_lost"])
                    .inc();
                continue;
            }

            match self
                .broker
                .publish(&event.topic, &event.partition_key, &event.payload)
                .await
            {
                Ok(()) => {
                    self.outbox.mark_published(&event.id, now).await?;
                    summary.published += 1;
                    OUTBOX_PUBLISHES_TOTAL
                        .with_label_values(&["published"])
                        .inc();
                }
                Err(PublishError::Rejected(reason)) => {
                    error!(event_id = %event.id, reason = %reason, "Outbox event rejected, dead-lettering");
                    self.outbox.mark_dead(&event.id, &reason, now).await?;
                    summary.dead += 1;
                    OUTBOX_PUBLISHES_TOTAL.with_label_values(&["dead"]).inc();
                }
                Err(PublishError::Unavailable(err)) => {
                    let delay = retry_delay(
                        event.attempts + 1,
                        self.config.backoff_base_secs,
                        self.config.backoff_cap_secs,
                    );
                    warn!(
                        event_id = %event.id,
                        error = %err,
                        retry_in_secs = delay.num_seconds(),
                        "Broker unavailable, scheduling retry"
                    );
                    self.outbox
                        .retry_later(&event.id, now + delay, &err.to_string())
                        .await?;
                    summary.retried += 1;
                    OUTBOX_PUBLISHES_TOTAL.with_label_values(&["retried"]).inc();
                }
            }
        }

        Ok(summary)
    }
}

/// Exponential backoff for transient delivery failures: base * 2^(n-1),
/// capped. The exponent is clamped so large attempt counters cannot
/// overflow the shift.
pub fn retry_delay(attempt: i64, base_secs: i64, cap_secs: i64) -> Duration {
    let base = base_secs.max(1);
    let cap = cap_secs.max(base);
    let exponent = (attempt - 1).clamp(0, 20) as u32;
    let delay = base.saturating_mul(1_i64 << exponent).min(cap);
    Duration::seconds(delay)
}
