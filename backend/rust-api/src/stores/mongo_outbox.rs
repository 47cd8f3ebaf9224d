use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, from_bson, to_bson, Bson, Document};
use mongodb::{Collection, Database, IndexModel};

use super::OutboxStore;
use crate::models::outbox::{OutboxEvent, OutboxStatus};
use crate::utils::time::{bson_to_chrono, chrono_to_bson};

const COLLECTION: &str = "outbox_events";

/// Outbox rows are mapped by hand so the lease and due timestamps land as
/// native BSON dates; the publisher's selection and recovery passes range
/// over them.
pub struct MongoOutboxStore {
    collection: Collection<Document>,
}

impl MongoOutboxStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(COLLECTION),
        }
    }

    pub async fn ensure_indexes(&self) -> Result<()> {
        let by_status_due = IndexModel::builder()
            .keys(doc! { "status": 1, "next_attempt_at": 1, "created_at": 1 })
            .build();
        self.collection
            .create_index(by_status_due)
            .await
            .context("Failed to create outbox status index")?;
        Ok(())
    }
}

fn to_document(event: &OutboxEvent) -> Result<Document> {
    let mut document = doc! {
        "_id": &event.id,
        "event_type": &event.event_type,
        "topic": &event.topic,
        "partition_key": &event.partition_key,
        "payload": to_bson(&event.payload).context("Failed to encode event payload")?,
        "status": event.status.as_str(),
        "attempts": event.attempts,
        "next_attempt_at": chrono_to_bson(event.next_attempt_at),
        "created_at": chrono_to_bson(event.created_at),
    };
    if let Some(leased_at) = event.leased_at {
        document.insert("leased_at", chrono_to_bson(leased_at));
    }
    if let Some(ref last_error) = event.last_error {
        document.insert("last_error", last_error);
    }
    if let Some(published_at) = event.published_at {
        document.insert("published_at", chrono_to_bson(published_at));
    }
    Ok(document)
}

fn parse_status(status: &str) -> Result<OutboxStatus> {
    match status {
        "pending" => Ok(OutboxStatus::Pending),
        "publishing" => Ok(OutboxStatus::Publishing),
        "published" => Ok(OutboxStatus::Published),
        "dead" => Ok(OutboxStatus::Dead),
        other => Err(anyhow!("Unknown outbox status: {other}")),
    }
}

fn from_document(document: Document) -> Result<OutboxEvent> {
    let id = document
        .get_str("_id")
        .context("Outbox document missing _id")?
        .to_string();
    let event_type = document
        .get_str("event_type")
        .context("Outbox document missing event_type")?
        .to_string();
    let topic = document
        .get_str("topic")
        .context("Outbox document missing topic")?
        .to_string();
    let partition_key = document
        .get_str("partition_key")
        .context("Outbox document missing partition_key")?
        .to_string();
    let payload = from_bson(
        document
            .get("payload")
            .cloned()
            .unwrap_or(Bson::Document(Document::new())),
    )
    .context("Failed to decode event payload")?;
    let status = parse_status(document.get_str("status").context("missing status")?)?;
    let attempts = document
        .get_i64("attempts")
        .or_else(|_| document.get_i32("attempts").map(i64::from))
        .unwrap_or(0);
    let next_attempt_at = bson_to_chrono(
        document
            .get_datetime("next_attempt_at")
            .context("Outbox document missing next_attempt_at")?
            .to_owned(),
    );
    let created_at = bson_to_chrono(
        document
            .get_datetime("created_at")
            .context("Outbox document missing created_at")?
            .to_owned(),
    );
    let leased_at = document
        .get_datetime("leased_at")
        .ok()
        .map(|dt| bson_to_chrono(dt.to_owned()));
    let published_at = document
        .get_datetime("published_at")
        .ok()
        .map(|dt| bson_to_chrono(dt.to_owned()));
    let last_error = document
        .get_str("last_error")
        .ok()
        .map(|value| value.to_string());

    Ok(OutboxEvent {
        id,
        event_type,
        topic,
        partition_key,
        payload,
        status,
        attempts,
        next_attempt_at,
        leased_at,
        last_error,
        created_at,
        published_at,
    })
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    if let mongodb::error::ErrorKind::Write(mongodb::error::WriteFailure::WriteError(ref we)) =
        *err.kind
    {
        return we.code == 11000;
    }
    false
}

#[async_trait]
impl OutboxStore for MongoOutboxStore {
    async fn enqueue(&self, event: &OutboxEvent) -> Result<bool> {
        let document = to_document(event)?;
        match self.collection.insert_one(document).await {
            Ok(_) => Ok(true),
            Err(err) if is_duplicate_key(&err) => Ok(false),
            Err(err) => Err(err).context("Failed to enqueue outbox event"),
        }
    }

    async fn reclaim_stale(
        &self,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let result = self
            .collection
            .update_many(
                doc! {
                    "status": "publishing",
                    "leased_at": { "$lt": chrono_to_bson(leased_before) },
                },
                doc! {
                    "$set": { "status": "pending", "next_attempt_at": chrono_to_bson(now) },
                    "$unset": { "leased_at": "" },
                },
            )
            .await
            .context("Failed to reclaim stale outbox leases")?;

        Ok(result.modified_count)
    }

    async fn fetch_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut cursor = self
            .collection
            .find(doc! {
                "status": "pending",
                "next_attempt_at": { "$lte": chrono_to_bson(now) },
            })
            .sort(doc! { "created_at": 1 })
            .limit(limit)
            .await
            .context("Failed to fetch pending outbox events")?;

        let mut events = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            events.push(from_document(document)?);
        }
        Ok(events)
    }

    async fn lease(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": event_id, "status": "pending" },
                doc! { "$set": { "status": "publishing", "leased_at": chrono_to_bson(now) } },
            )
            .await
            .context("Failed to lease outbox event")?;

        Ok(result.matched_count == 1)
    }

    async fn mark_published(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": event_id, "status": "publishing" },
                doc! {
                    "$set": { "status": "published", "published_at": chrono_to_bson(now) },
                    "$unset": { "leased_at": "" },
                },
            )
            .await
            .context("Failed to mark outbox event published")?;
        Ok(())
    }

    async fn mark_dead(&self, event_id: &str, error: &str, now: DateTime<Utc>) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": event_id, "status": "publishing" },
                doc! {
                    "$set": {
                        "status": "dead",
                        "last_error": error,
                        "updated_at": chrono_to_bson(now),
                    },
                    "$inc": { "attempts": 1 },
                    "$unset": { "leased_at": "" },
                },
            )
            .await
            .context("Failed to dead-letter outbox event")?;
        Ok(())
    }

    async fn retry_later(
        &self,
        event_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        self.collection
            .update_one(
                doc! { "_id": event_id, "status": "publishing" },
                doc! {
                    "$set": {
                        "status": "pending",
                        "next_attempt_at": chrono_to_bson(next_attempt_at),
                        "last_error": error,
                    },
                    "$inc": { "attempts": 1 },
                    "$unset": { "leased_at": "" },
                },
            )
            .await
            .context("Failed to schedule outbox retry")?;
        Ok(())
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let mut cursor = self
            .collection
            .find(doc! { "status": "dead" })
            .sort(doc! { "created_at": 1 })
            .limit(limit)
            .await
            .context("Failed to list dead outbox events")?;

        let mut events = Vec::new();
        while let Some(document) = cursor.try_next().await? {
            events.push(from_document(document)?);
        }
        Ok(events)
    }

    async fn requeue_dead(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": event_id, "status": "dead" },
                doc! {
                    "$set": { "status": "pending", "next_attempt_at": chrono_to_bson(now) },
                    "$unset": { "last_error": "" },
                },
            )
            .await
            .context("Failed to requeue dead outbox event")?;

        Ok(result.matched_count == 1)
    }
}
