use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::IndexOptions;
use mongodb::{Collection, Database, IndexModel};

use super::{AttemptStore, InsertAttempt};
use crate::grading::GradeResult;
use crate::models::attempt::{AnswerMap, Attempt, AttemptState, FinalizeTrigger};

const COLLECTION: &str = "attempts";

pub struct MongoAttemptStore {
    collection: Collection<Attempt>,
}

impl MongoAttemptStore {
    pub fn new(db: &Database) -> Self {
        Self {
            collection: db.collection(COLLECTION),
        }
    }

    /// Partial unique index backing the at-most-one in_progress attempt per
    /// (student, schedule) invariant. The lookup-before-insert in the service
    /// handles the common path; this index settles concurrent starters.
    pub async fn ensure_indexes(&self) -> Result<()> {
        let unique_active = IndexModel::builder()
            .keys(doc! { "student_id": 1, "schedule_id": 1 })
            .options(
                IndexOptions::builder()
                    .unique(true)
                    .partial_filter_expression(doc! { "state": AttemptState::InProgress.as_str() })
                    .build(),
            )
            .build();
        self.collection
            .create_index(unique_active)
            .await
            .context("Failed to create attempts unique index")?;

        let by_quiz_state = IndexModel::builder()
            .keys(doc! { "quiz_id": 1, "state": 1 })
            .build();
        self.collection
            .create_index(by_quiz_state)
            .await
            .context("Failed to create attempts quiz/state index")?;

        Ok(())
    }
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
impl AttemptStore for MongoAttemptStore {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertAttempt> {
        match self.collection.insert_one(attempt).await {
            Ok(_) => Ok(InsertAttempt::Created),
            Err(err) if is_duplicate_key(&err) => {
                let existing = self
                    .find_in_progress(&attempt.student_id, &attempt.schedule_id)
                    .await?
                    .context("Duplicate-key insert but no in_progress attempt found")?;
                Ok(InsertAttempt::AlreadyInProgress(existing))
            }
            Err(err) => Err(err).context("Failed to insert attempt"),
        }
    }

    async fn find(&self, id: &str) -> Result<Option<Attempt>> {
        self.collection
            .find_one(doc! { "_id": id })
            .await
            .context("Failed to query attempt")
    }

    async fn find_in_progress(
        &self,
        student_id: &str,
        schedule_id: &str,
    ) -> Result<Option<Attempt>> {
        self.collection
            .find_one(doc! {
                "student_id": student_id,
                "schedule_id": schedule_id,
                "state": AttemptState::InProgress.as_str(),
            })
            .await
            .context("Failed to query in_progress attempt")
    }

    async fn find_in_progress_by_quiz(&self, quiz_id: &str) -> Result<Vec<String>> {
        let mut cursor = self
            .collection
            .find(doc! { "quiz_id": quiz_id, "state": AttemptState::InProgress.as_str() })
            .await
            .context("Failed to query attempts by quiz")?;

        let mut ids = Vec::new();
        while let Some(attempt) = cursor.try_next().await? {
            ids.push(attempt.id);
        }
        Ok(ids)
    }

    async fn merge_answers(
        &self,
        id: &str,
        expected_version: i64,
        patch: &AnswerMap,
        saved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut set = Document::new();
        for (item_id, value) in patch {
            set.insert(
                format!("answers.{item_id}"),
                to_bson(value).context("Failed to encode answer value")?,
            );
        }
        set.insert("last_saved_at", to_bson(&saved_at)?);
        set.insert("updated_at", to_bson(&saved_at)?);

        let result = self
            .collection
            .update_one(
                doc! {
                    "_id": id,
                    "state": AttemptState::InProgress.as_str(),
                    "attempt_version": expected_version,
                },
                doc! { "$set": set, "$inc": { "attempt_version": 1 } },
            )
            .await
            .context("Failed to merge answers")?;

        Ok(result.matched_count == 1)
    }

    async fn finalize(
        &self,
        id: &str,
        grade: &GradeResult,
        trigger: FinalizeTrigger,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "state": AttemptState::InProgress.as_str() },
                doc! {
                    "$set": {
                        "state": AttemptState::Finalized.as_str(),
                        "finished_at": to_bson(&finished_at)?,
                        "score": grade.total,
                        "max_score": grade.max,
                        "breakdown": to_bson(&grade.breakdown)?,
                        "finalize_trigger": trigger.as_str(),
                        "updated_at": to_bson(&finished_at)?,
                    },
                    "$inc": { "attempt_version": 1 },
                },
            )
            .await
            .context("Failed to finalize attempt")?;

        Ok(result.matched_count == 1)
    }

    async fn invalidate(&self, id: &str, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = self
            .collection
            .update_one(
                doc! { "_id": id, "state": { "$ne": AttemptState::Invalidated.as_str() } },
                doc! {
                    "$set": {
                        "state": AttemptState::Invalidated.as_str(),
                        "invalidated_reason": reason,
                        "finished_at": to_bson(&at)?,
                        "updated_at": to_bson(&at)?,
                    },
                    "$inc": { "attempt_version": 1 },
                },
            )
            .await
            .context("Failed to invalidate attempt")?;

        Ok(result.matched_count == 1)
    }
}
