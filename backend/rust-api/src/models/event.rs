use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::attempt::Attempt;
use super::outbox::{OutboxEvent, OutboxStatus};

pub const TOPIC_ATTEMPT_FINALIZED: &str = "attempt.finalized";
pub const TOPIC_ATTEMPT_INVALIDATED: &str = "attempt.invalidated";

/// Canonical wire envelope for a domain event.
///
/// Builders are pure functions of (attempt, occurred_at). Event ids are
/// deterministic per (attempt, transition), so any number of re-emits of the
/// same transition collapse into one outbox row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: String,
    pub topic: String,
    pub partition_key: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: Value,
}

impl EventEnvelope {
    /// Carries everything the downstream statistics service needs to update
    /// its materialized view without calling back into this system.
    pub fn attempt_finalized(attempt: &Attempt, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: format!("attempt:{}:finalized", attempt.id),
            event_type: "AttemptFinalized".to_string(),
            topic: TOPIC_ATTEMPT_FINALIZED.to_string(),
            partition_key: attempt.id.clone(),
            occurred_at,
            payload: json!({
                "attempt_id": attempt.id,
                "quiz_id": attempt.quiz_id,
                "quiz_root_id": attempt.quiz_root_id,
                "quiz_version": attempt.quiz_version,
                "quiz_title": attempt.snapshot.title,
                "student_id": attempt.student_id,
                "class_id": attempt.class_id,
                "schedule_id": attempt.schedule_id,
                "score": attempt.score,
                "max_score": attempt.max_score,
                "trigger": attempt.finalize_trigger,
                "started_at": attempt.started_at,
                "finished_at": attempt.finished_at,
            }),
        }
    }

    pub fn attempt_invalidated(attempt: &Attempt, occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: format!("attempt:{}:invalidated", attempt.id),
            event_type: "AttemptInvalidated".to_string(),
            topic: TOPIC_ATTEMPT_INVALIDATED.to_string(),
            partition_key: attempt.id.clone(),
            occurred_at,
            payload: json!({
                "attempt_id": attempt.id,
                "quiz_id": attempt.quiz_id,
                "quiz_root_id": attempt.quiz_root_id,
                "quiz_version": attempt.quiz_version,
                "student_id": attempt.student_id,
                "class_id": attempt.class_id,
                "schedule_id": attempt.schedule_id,
                "reason": attempt.invalidated_reason,
                "invalidated_at": attempt.finished_at,
            }),
        }
    }

    pub fn into_outbox_event(self, now: DateTime<Utc>) -> OutboxEvent {
        OutboxEvent {
            id: self.event_id,
            event_type: self.event_type,
            topic: self.topic,
            partition_key: self.partition_key,
            payload: json!({
                "occurred_at": self.occurred_at,
                "data": self.payload,
            }),
            status: OutboxStatus::Pending,
            attempts: 0,
            next_attempt_at: now,
            leased_at: None,
            last_error: None,
            created_at: now,
            published_at: None,
        }
    }
}
