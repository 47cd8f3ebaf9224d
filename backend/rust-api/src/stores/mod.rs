use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::grading::GradeResult;
use crate::models::attempt::{AnswerMap, Attempt, FinalizeTrigger};
use crate::models::outbox::OutboxEvent;
use crate::models::quiz::QuizDoc;

pub mod mongo_attempts;
pub mod mongo_outbox;
pub mod mongo_quizzes;
pub mod redis_deadlines;

pub use mongo_attempts::MongoAttemptStore;
pub use mongo_outbox::MongoOutboxStore;
pub use mongo_quizzes::MongoQuizStore;
pub use redis_deadlines::RedisDeadlineIndex;

#[derive(Debug)]
pub enum InsertAttempt {
    Created,
    /// Another starter won the (student, schedule) uniqueness race; the
    /// winner's attempt comes back so the caller can resume it.
    AlreadyInProgress(Attempt),
}

/// Durable CRUD plus conditional updates over attempts. Every mutation is a
/// single compare-and-swap keyed on the record's current state or version;
/// that conditional write is the only cross-replica coordination mechanism.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertAttempt>;

    async fn find(&self, id: &str) -> Result<Option<Attempt>>;

    async fn find_in_progress(&self, student_id: &str, schedule_id: &str)
        -> Result<Option<Attempt>>;

    async fn find_in_progress_by_quiz(&self, quiz_id: &str) -> Result<Vec<String>>;

    /// Merge the given keys over stored answers, conditioned on the stored
    /// version still matching. Returns false when the condition missed.
    async fn merge_answers(
        &self,
        id: &str,
        expected_version: i64,
        patch: &AnswerMap,
        saved_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `WHERE state = in_progress` transition to finalized. Returns false
    /// when another trigger already finalized or invalidated the attempt.
    async fn finalize(
        &self,
        id: &str,
        grade: &GradeResult,
        trigger: FinalizeTrigger,
        finished_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `WHERE state != invalidated` transition. Returns false on a no-op.
    async fn invalidate(&self, id: &str, reason: &str, at: DateTime<Utc>) -> Result<bool>;
}

/// Durable event log with insert-or-ignore semantics keyed by event id.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns false when an event with the same id already exists; callers
    /// treat that as success.
    async fn enqueue(&self, event: &OutboxEvent) -> Result<bool>;

    /// Crash recovery: leases older than the cutoff go back to pending,
    /// due immediately. Returns how many were reclaimed.
    async fn reclaim_stale(&self, leased_before: DateTime<Utc>, now: DateTime<Utc>)
        -> Result<u64>;

    /// Pending events due by `now`, oldest first.
    async fn fetch_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>>;

    /// `pending -> publishing`, conditioned on the status still being
    /// pending. False means another publisher replica holds the lease.
    async fn lease(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool>;

    async fn mark_published(&self, event_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn mark_dead(&self, event_id: &str, error: &str, now: DateTime<Utc>) -> Result<()>;

    /// `publishing -> pending` with a bumped attempt counter and a future
    /// due time.
    async fn retry_later(
        &self,
        event_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()>;

    async fn list_dead(&self, limit: i64) -> Result<Vec<OutboxEvent>>;

    /// Operator action: `dead -> pending`, due immediately.
    async fn requeue_dead(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool>;
}

/// Sorted index of (attempt id, absolute deadline).
#[async_trait]
pub trait DeadlineIndex: Send + Sync {
    async fn schedule(&self, attempt_id: &str, deadline: DateTime<Utc>) -> Result<()>;

    async fn clear(&self, attempt_id: &str) -> Result<()>;

    /// Atomically remove and return up to `limit` entries due by `now`.
    /// Claiming only reduces duplicate work between worker replicas; the
    /// attempt store's conditional finalize is what guarantees exclusivity.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>>;
}

/// Read-only access to upstream quiz documents.
#[async_trait]
pub trait QuizStore: Send + Sync {
    async fn find(&self, quiz_id: &str) -> Result<Option<QuizDoc>>;
}
