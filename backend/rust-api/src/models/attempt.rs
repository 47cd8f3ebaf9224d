use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::grading::QuizSnapshot;

/// Answers keyed by item id. A BTreeMap keeps grading and hashing iteration
/// order stable across processes.
pub type AnswerMap = BTreeMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptState {
    InProgress,
    Finalized,
    Invalidated,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptState::InProgress => "in_progress",
            AttemptState::Finalized => "finalized",
            AttemptState::Invalidated => "invalidated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, AttemptState::InProgress)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalizeTrigger {
    Manual,
    Expiry,
}

impl FinalizeTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalizeTrigger::Manual => "manual",
            FinalizeTrigger::Expiry => "expiry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemScore {
    pub item_id: String,
    pub awarded: i64,
    pub max: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

/// One student's run against one quiz version. Soft-terminal: attempts are
/// never deleted, they end up `finalized` or `invalidated`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    #[serde(rename = "_id")]
    pub id: String,
    pub quiz_id: String,
    pub quiz_root_id: String,
    pub quiz_version: i64,
    pub student_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_id: Option<String>,
    pub schedule_id: String,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    #[serde(default)]
    pub breakdown: Vec<ItemScore>,
    /// Immutable copy of the quiz spec and grading key taken at start. The
    /// only input grading ever reads, so concurrent quiz edits cannot touch
    /// an in-flight attempt.
    pub snapshot: QuizSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize_trigger: Option<FinalizeTrigger>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalidated_reason: Option<String>,
    pub attempt_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StartAttemptRequest {
    #[validate(length(min = 1))]
    pub quiz_id: String,
    #[validate(length(min = 1))]
    pub student_id: String,
    pub class_id: Option<String>,
    #[validate(length(min = 1))]
    pub schedule_id: String,
    /// Close time of the schedule window, when one applies.
    pub schedule_closes_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitAnswersRequest {
    pub answers: AnswerMap,
    /// Optimistic concurrency check against the stored `attempt_version`.
    pub expected_version: Option<i64>,
}

/// Client-facing projection of an attempt. The grading key never leaves the
/// server; students only see the render spec.
#[derive(Debug, Serialize)]
pub struct AttemptView {
    pub id: String,
    pub quiz_id: String,
    pub quiz_version: i64,
    pub student_id: String,
    pub schedule_id: String,
    pub state: AttemptState,
    pub started_at: DateTime<Utc>,
    pub deadline_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_saved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub answers: AnswerMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<i64>,
    pub breakdown: Vec<ItemScore>,
    pub render_spec: Value,
    pub attempt_version: i64,
}

impl From<Attempt> for AttemptView {
    fn from(attempt: Attempt) -> Self {
        Self {
            id: attempt.id,
            quiz_id: attempt.quiz_id,
            quiz_version: attempt.quiz_version,
            student_id: attempt.student_id,
            schedule_id: attempt.schedule_id,
            state: attempt.state,
            started_at: attempt.started_at,
            deadline_at: attempt.deadline_at,
            last_saved_at: attempt.last_saved_at,
            finished_at: attempt.finished_at,
            answers: attempt.answers,
            score: attempt.score,
            max_score: attempt.max_score,
            breakdown: attempt.breakdown,
            render_spec: attempt.snapshot.render_spec,
            attempt_version: attempt.attempt_version,
        }
    }
}
