use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;
use validator::Validate;

use crate::config::AttemptsConfig;
use crate::error::CoreError;
use crate::grading::GradingRegistry;
use crate::metrics::{
    ANSWER_SUBMISSIONS_TOTAL, ATTEMPTS_ACTIVE, ATTEMPTS_FINALIZED_TOTAL,
    ATTEMPTS_INVALIDATED_TOTAL, ATTEMPTS_TOTAL,
};
use crate::models::attempt::{
    Attempt, AttemptState, FinalizeTrigger, StartAttemptRequest, SubmitAnswersRequest,
};
use crate::services::event_emitter::EventEmitter;
use crate::stores::{AttemptStore, DeadlineIndex, InsertAttempt, QuizStore};
use crate::utils::retry::{retry_async_with_config, RetryConfig};

#[derive(Debug)]
pub struct StartOutcome {
    pub attempt: Attempt,
    pub resumed: bool,
}

/// Orchestrates the attempt state machine. All race resolution lives in the
/// store's conditional updates; this service decides what each caller gets
/// to observe when a race is lost.
pub struct AttemptService {
    store: Arc<dyn AttemptStore>,
    quizzes: Arc<dyn QuizStore>,
    deadlines: Arc<dyn DeadlineIndex>,
    emitter: EventEmitter,
    registry: Arc<GradingRegistry>,
    config: AttemptsConfig,
}

impl AttemptService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        quizzes: Arc<dyn QuizStore>,
        deadlines: Arc<dyn DeadlineIndex>,
        emitter: EventEmitter,
        registry: Arc<GradingRegistry>,
        config: AttemptsConfig,
    ) -> Self {
        Self {
            store,
            quizzes,
            deadlines,
            emitter,
            registry,
            config,
        }
    }

    /// Starts an attempt, or resumes the student's existing in_progress one
    /// for the same schedule.
    pub async fn start(&self, req: StartAttemptRequest) -> Result<StartOutcome, CoreError> {
        req.validate()
            .map_err(|err| CoreError::Validation(err.to_string()))?;

        let retry_cfg = RetryConfig::default();
        if let Some(existing) = retry_async_with_config(retry_cfg.clone(), || async {
            self.store
                .find_in_progress(&req.student_id, &req.schedule_id)
                .await
        })
        .await?
        {
            return Ok(self.resume(existing).await);
        }

        let quiz = retry_async_with_config(retry_cfg, || async {
            self.quizzes.find(&req.quiz_id).await
        })
        .await?
        .ok_or_else(|| CoreError::not_found("quiz", &req.quiz_id))?;

        let strategy = self.registry.resolve(&quiz.quiz_type)?;
        let snapshot = strategy.build_spec(&quiz)?;

        let now = Utc::now();
        let deadline = compute_deadline(
            now,
            snapshot.time_limit_seconds,
            req.schedule_closes_at,
            &self.config,
        );

        let attempt = Attempt {
            id: Uuid::new_v4().to_string(),
            quiz_id: quiz.id.clone(),
            quiz_root_id: quiz.root_id.clone(),
            quiz_version: quiz.version,
            student_id: req.student_id.clone(),
            class_id: req.class_id.clone(),
            schedule_id: req.schedule_id.clone(),
            state: AttemptState::InProgress,
            started_at: now,
            deadline_at: deadline,
            last_saved_at: None,
            finished_at: None,
            answers: Default::default(),
            score: None,
            max_score: None,
            breakdown: Vec::new(),
            snapshot,
            finalize_trigger: None,
            invalidated_reason: None,
            attempt_version: 1,
            created_at: now,
            updated_at: now,
        };

        let attempt = match self.store.insert(&attempt).await? {
            InsertAttempt::Created => attempt,
            InsertAttempt::AlreadyInProgress(existing) => {
                tracing::info!(
                    student_id = %req.student_id,
                    schedule_id = %req.schedule_id,
                    "Concurrent start lost the uniqueness race, resuming winner"
                );
                return Ok(self.resume(existing).await);
            }
        };

        // ZADD is an upsert, so retrying a lost schedule write is safe.
        retry_async_with_config(RetryConfig::aggressive(), || async {
            self.deadlines.schedule(&attempt.id, deadline).await
        })
        .await?;

        ATTEMPTS_TOTAL.with_label_values(&["started"]).inc();
        ATTEMPTS_ACTIVE.inc();
        tracing::info!(
            attempt_id = %attempt.id,
            quiz_id = %attempt.quiz_id,
            student_id = %attempt.student_id,
            deadline = %deadline,
            "Attempt started"
        );

        Ok(StartOutcome {
            attempt,
            resumed: false,
        })
    }

    /// The deadline entry is reconstructable from the stored attempt, so a
    /// resume re-schedules it in case the original schedule write was lost.
    async fn resume(&self, attempt: Attempt) -> StartOutcome {
        if let Err(err) = self
            .deadlines
            .schedule(&attempt.id, attempt.deadline_at)
            .await
        {
            tracing::warn!(attempt_id = %attempt.id, error = %err, "Failed to re-schedule deadline on resume");
        }
        ATTEMPTS_TOTAL.with_label_values(&["resumed"]).inc();
        tracing::info!(attempt_id = %attempt.id, "Attempt resumed");
        StartOutcome {
            attempt,
            resumed: true,
        }
    }

    pub async fn get(&self, id: &str) -> Result<Attempt, CoreError> {
        self.load(id).await
    }

    /// Merges the submitted keys over stored answers, last writer wins per
    /// key. The conditional write is keyed on the loaded version, so any
    /// concurrent mutation surfaces as a VersionConflict for this caller.
    pub async fn submit_answers(
        &self,
        id: &str,
        req: SubmitAnswersRequest,
    ) -> Result<Attempt, CoreError> {
        if req.answers.is_empty() {
            return Err(CoreError::validation("no answers provided"));
        }
        for item_id in req.answers.keys() {
            if item_id.is_empty() || item_id.contains('.') || item_id.starts_with('$') {
                return Err(CoreError::validation(format!(
                    "invalid item id: {item_id:?}"
                )));
            }
        }

        let attempt = self.load(id).await?;
        if attempt.state != AttemptState::InProgress {
            ANSWER_SUBMISSIONS_TOTAL
                .with_label_values(&["state_conflict"])
                .inc();
            return Err(CoreError::StateConflict {
                state: attempt.state,
            });
        }
        if let Some(expected) = req.expected_version {
            if expected != attempt.attempt_version {
                ANSWER_SUBMISSIONS_TOTAL
                    .with_label_values(&["version_conflict"])
                    .inc();
                return Err(CoreError::VersionConflict {
                    expected,
                    stored: attempt.attempt_version,
                });
            }
        }

        let now = Utc::now();
        let matched = self
            .store
            .merge_answers(id, attempt.attempt_version, &req.answers, now)
            .await?;

        if !matched {
            let current = self.load(id).await?;
            ANSWER_SUBMISSIONS_TOTAL
                .with_label_values(&["version_conflict"])
                .inc();
            if current.state != AttemptState::InProgress {
                return Err(CoreError::StateConflict {
                    state: current.state,
                });
            }
            return Err(CoreError::VersionConflict {
                expected: attempt.attempt_version,
                stored: current.attempt_version,
            });
        }

        ANSWER_SUBMISSIONS_TOTAL.with_label_values(&["saved"]).inc();
        tracing::debug!(attempt_id = %id, keys = req.answers.len(), "Answers saved");
        self.load(id).await
    }

    /// Finalizes the attempt exactly once across all triggers. Losing the
    /// race is success for a manual caller (they observe the stored result)
    /// and a logged no-op for the expiry sweep.
    pub async fn finalize(
        &self,
        id: &str,
        trigger: FinalizeTrigger,
    ) -> Result<Attempt, CoreError> {
        let attempt = self.load(id).await?;

        match attempt.state {
            AttemptState::Finalized => {
                // Re-emit heals a crash between the finalize write and the
                // enqueue; the deterministic event id dedups everything else.
                self.emitter.attempt_finalized(&attempt).await?;
                return Ok(attempt);
            }
            AttemptState::Invalidated => {
                return match trigger {
                    FinalizeTrigger::Manual => Err(CoreError::StateConflict {
                        state: attempt.state,
                    }),
                    FinalizeTrigger::Expiry => {
                        tracing::debug!(attempt_id = %id, "Expired attempt already invalidated");
                        Ok(attempt)
                    }
                };
            }
            AttemptState::InProgress => {}
        }

        let strategy = self.registry.resolve(&attempt.snapshot.quiz_type)?;
        let grade = strategy.grade(&attempt.snapshot, &attempt.answers);
        let now = Utc::now();

        let won = self.store.finalize(id, &grade, trigger, now).await?;
        if !won {
            let current = self.load(id).await?;
            if trigger == FinalizeTrigger::Manual && current.state == AttemptState::Invalidated {
                return Err(CoreError::StateConflict {
                    state: current.state,
                });
            }
            tracing::info!(
                attempt_id = %id,
                trigger = trigger.as_str(),
                "Finalize lost the race, returning stored result"
            );
            if current.state == AttemptState::Finalized {
                self.emitter.attempt_finalized(&current).await?;
            }
            return Ok(current);
        }

        if let Err(err) = self.deadlines.clear(id).await {
            tracing::warn!(attempt_id = %id, error = %err, "Failed to clear deadline entry");
        }

        let finalized = self.load(id).await?;
        self.emitter.attempt_finalized(&finalized).await?;

        ATTEMPTS_FINALIZED_TOTAL
            .with_label_values(&[trigger.as_str()])
            .inc();
        ATTEMPTS_ACTIVE.dec();
        tracing::info!(
            attempt_id = %id,
            trigger = trigger.as_str(),
            score = grade.total,
            max_score = grade.max,
            "Attempt finalized"
        );

        Ok(finalized)
    }

    /// Used when the upstream quiz disappears or is replaced. Idempotent via
    /// the store's conditional update; also fires on finalized attempts so
    /// the downstream consumer can retract their scores.
    pub async fn invalidate(&self, id: &str, reason: &str) -> Result<Attempt, CoreError> {
        let attempt = self.load(id).await?;
        if attempt.state == AttemptState::Invalidated {
            self.emitter.attempt_invalidated(&attempt).await?;
            return Ok(attempt);
        }

        let was_in_progress = attempt.state == AttemptState::InProgress;
        let now = Utc::now();
        let won = self.store.invalidate(id, reason, now).await?;

        if won {
            if let Err(err) = self.deadlines.clear(id).await {
                tracing::warn!(attempt_id = %id, error = %err, "Failed to clear deadline entry");
            }
            ATTEMPTS_INVALIDATED_TOTAL.inc();
            if was_in_progress {
                ATTEMPTS_ACTIVE.dec();
            }
            tracing::info!(attempt_id = %id, reason = reason, "Attempt invalidated");
        }

        let current = self.load(id).await?;
        if current.state == AttemptState::Invalidated {
            self.emitter.attempt_invalidated(&current).await?;
        }
        Ok(current)
    }

    /// Cascade for quiz deletion/replacement. Lost races are expected here,
    /// so per-attempt failures are logged and the sweep continues.
    pub async fn invalidate_for_quiz(
        &self,
        quiz_id: &str,
        reason: &str,
    ) -> Result<usize, CoreError> {
        let ids = self.store.find_in_progress_by_quiz(quiz_id).await?;
        let mut invalidated = 0;
        for id in &ids {
            match self.invalidate(id, reason).await {
                Ok(_) => invalidated += 1,
                Err(err) => {
                    tracing::warn!(attempt_id = %id, error = %err, "Failed to invalidate attempt in cascade");
                }
            }
        }
        Ok(invalidated)
    }

    async fn load(&self, id: &str) -> Result<Attempt, CoreError> {
        self.store
            .find(id)
            .await?
            .ok_or_else(|| CoreError::not_found("attempt", id))
    }
}

/// Earliest of the quiz-intrinsic budget, the schedule close and the hard
/// ceiling, plus a short grace period. The TTL is clamped positive so an
/// already-past deadline is still processed on the next worker tick, and it
/// never exceeds the ceiling.
pub fn compute_deadline(
    now: DateTime<Utc>,
    intrinsic_limit_seconds: Option<u32>,
    schedule_closes_at: Option<DateTime<Utc>>,
    config: &AttemptsConfig,
) -> DateTime<Utc> {
    let min_ttl = Duration::seconds(config.min_ttl_secs.max(1));
    let ceiling = Duration::seconds(config.ttl_ceiling_secs.max(config.min_ttl_secs.max(1)));

    let mut naive = now + ceiling;
    if let Some(seconds) = intrinsic_limit_seconds {
        naive = naive.min(now + Duration::seconds(i64::from(seconds)));
    }
    if let Some(closes_at) = schedule_closes_at {
        naive = naive.min(closes_at);
    }

    let ttl = (naive + Duration::seconds(config.grace_period_secs.max(0)) - now)
        .clamp(min_ttl, ceiling);
    now + ttl
}
