#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use quizbench_api::broker::{BrokerClient, PublishError};
use quizbench_api::config::{AttemptsConfig, Config, OutboxConfig};
use quizbench_api::create_router;
use quizbench_api::grading::{GradeResult, GradingRegistry};
use quizbench_api::models::attempt::{AnswerMap, Attempt, AttemptState, FinalizeTrigger};
use quizbench_api::models::outbox::{OutboxEvent, OutboxStatus};
use quizbench_api::models::quiz::{QuizDoc, QuizItem};
use quizbench_api::services::AppState;
use quizbench_api::stores::{
    AttemptStore, DeadlineIndex, InsertAttempt, OutboxStore, QuizStore,
};

/// In-memory stand-ins for the durable stores. Each one mirrors the
/// conditional-update contract of its production counterpart, so the
/// services' race resolution can be exercised without infrastructure.
#[derive(Default)]
pub struct MemoryAttemptStore {
    attempts: Mutex<HashMap<String, Attempt>>,
}

impl MemoryAttemptStore {
    pub fn get(&self, id: &str) -> Option<Attempt> {
        self.attempts.lock().unwrap().get(id).cloned()
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn insert(&self, attempt: &Attempt) -> Result<InsertAttempt> {
        let mut attempts = self.attempts.lock().unwrap();
        let existing = attempts.values().find(|candidate| {
            candidate.student_id == attempt.student_id
                && candidate.schedule_id == attempt.schedule_id
                && candidate.state == AttemptState::InProgress
        });
        if let Some(existing) = existing {
            return Ok(InsertAttempt::AlreadyInProgress(existing.clone()));
        }
        attempts.insert(attempt.id.clone(), attempt.clone());
        Ok(InsertAttempt::Created)
    }

    async fn find(&self, id: &str) -> Result<Option<Attempt>> {
        Ok(self.attempts.lock().unwrap().get(id).cloned())
    }

    async fn find_in_progress(
        &self,
        student_id: &str,
        schedule_id: &str,
    ) -> Result<Option<Attempt>> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .values()
            .find(|attempt| {
                attempt.student_id == student_id
                    && attempt.schedule_id == schedule_id
                    && attempt.state == AttemptState::InProgress
            })
            .cloned())
    }

    async fn find_in_progress_by_quiz(&self, quiz_id: &str) -> Result<Vec<String>> {
        Ok(self
            .attempts
            .lock()
            .unwrap()
            .values()
            .filter(|attempt| {
                attempt.quiz_id == quiz_id && attempt.state == AttemptState::InProgress
            })
            .map(|attempt| attempt.id.clone())
            .collect())
    }

    async fn merge_answers(
        &self,
        id: &str,
        expected_version: i64,
        patch: &AnswerMap,
        saved_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut attempts = self.attempts.lock().unwrap();
        let Some(attempt) = attempts.get_mut(id) else {
            return Ok(false);
        };
        if attempt.state != AttemptState::InProgress
            || attempt.attempt_version != expected_version
        {
            return Ok(false);
        }
        for (key, value) in patch {
            attempt.answers.insert(key.clone(), value.clone());
        }
        attempt.attempt_version += 1;
        attempt.last_saved_at = Some(saved_at);
        attempt.updated_at = saved_at;
        Ok(true)
    }

    async fn finalize(
        &self,
        id: &str,
        grade: &GradeResult,
        trigger: FinalizeTrigger,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut attempts = self.attempts.lock().unwrap();
        let Some(attempt) = attempts.get_mut(id) else {
            return Ok(false);
        };
        if attempt.state != AttemptState::InProgress {
            return Ok(false);
        }
        attempt.state = AttemptState::Finalized;
        attempt.finished_at = Some(finished_at);
        attempt.score = Some(grade.total);
        attempt.max_score = Some(grade.max);
        attempt.breakdown = grade.breakdown.clone();
        attempt.finalize_trigger = Some(trigger);
        attempt.attempt_version += 1;
        attempt.updated_at = finished_at;
        Ok(true)
    }

    async fn invalidate(&self, id: &str, reason: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut attempts = self.attempts.lock().unwrap();
        let Some(attempt) = attempts.get_mut(id) else {
            return Ok(false);
        };
        if attempt.state == AttemptState::Invalidated {
            return Ok(false);
        }
        attempt.state = AttemptState::Invalidated;
        attempt.invalidated_reason = Some(reason.to_string());
        attempt.finished_at = Some(at);
        attempt.attempt_version += 1;
        attempt.updated_at = at;
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryOutboxStore {
    events: Mutex<Vec<OutboxEvent>>,
}

impl MemoryOutboxStore {
    pub fn events(&self) -> Vec<OutboxEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn seed(&self, event: OutboxEvent) {
        self.events.lock().unwrap().push(event);
    }

    pub fn get(&self, id: &str) -> Option<OutboxEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .find(|event| event.id == id)
            .cloned()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn enqueue(&self, event: &OutboxEvent) -> Result<bool> {
        let mut events = self.events.lock().unwrap();
        if events.iter().any(|candidate| candidate.id == event.id) {
            return Ok(false);
        }
        events.push(event.clone());
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        leased_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut events = self.events.lock().unwrap();
        let mut reclaimed = 0;
        for event in events.iter_mut() {
            if event.status == OutboxStatus::Publishing
                && event.leased_at.is_some_and(|at| at < leased_before)
            {
                event.status = OutboxStatus::Pending;
                event.next_attempt_at = now;
                event.leased_at = None;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    async fn fetch_pending(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<OutboxEvent>> {
        let events = self.events.lock().unwrap();
        let mut pending: Vec<OutboxEvent> = events
            .iter()
            .filter(|event| event.status == OutboxStatus::Pending && event.next_attempt_at <= now)
            .cloned()
            .collect();
        pending.sort_by_key(|event| event.created_at);
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn lease(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut events = self.events.lock().unwrap();
        let Some(event) = events.iter_mut().find(|event| event.id == event_id) else {
            return Ok(false);
        };
        if event.status != OutboxStatus::Pending {
            return Ok(false);
        }
        event.status = OutboxStatus::Publishing;
        event.leased_at = Some(now);
        Ok(true)
    }

    async fn mark_published(&self, event_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(event) = events
            .iter_mut()
            .find(|event| event.id == event_id && event.status == OutboxStatus::Publishing)
        {
            event.status = OutboxStatus::Published;
            event.published_at = Some(now);
            event.leased_at = None;
        }
        Ok(())
    }

    async fn mark_dead(&self, event_id: &str, error: &str, _now: DateTime<Utc>) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(event) = events
            .iter_mut()
            .find(|event| event.id == event_id && event.status == OutboxStatus::Publishing)
        {
            event.status = OutboxStatus::Dead;
            event.last_error = Some(error.to_string());
            event.attempts += 1;
            event.leased_at = None;
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        event_id: &str,
        next_attempt_at: DateTime<Utc>,
        error: &str,
    ) -> Result<()> {
        let mut events = self.events.lock().unwrap();
        if let Some(event) = events
            .iter_mut()
            .find(|event| event.id == event_id && event.status == OutboxStatus::Publishing)
        {
            event.status = OutboxStatus::Pending;
            event.next_attempt_at = next_attempt_at;
            event.last_error = Some(error.to_string());
            event.attempts += 1;
            event.leased_at = None;
        }
        Ok(())
    }

    async fn list_dead(&self, limit: i64) -> Result<Vec<OutboxEvent>> {
        let events = self.events.lock().unwrap();
        let mut dead: Vec<OutboxEvent> = events
            .iter()
            .filter(|event| event.status == OutboxStatus::Dead)
            .cloned()
            .collect();
        dead.sort_by_key(|event| event.created_at);
        dead.truncate(limit.max(0) as usize);
        Ok(dead)
    }

    async fn requeue_dead(&self, event_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let mut events = self.events.lock().unwrap();
        let Some(event) = events
            .iter_mut()
            .find(|event| event.id == event_id && event.status == OutboxStatus::Dead)
        else {
            return Ok(false);
        };
        event.status = OutboxStatus::Pending;
        event.next_attempt_at = now;
        event.last_error = None;
        Ok(true)
    }
}

#[derive(Default)]
pub struct MemoryDeadlineIndex {
    entries: Mutex<BTreeMap<String, DateTime<Utc>>>,
}

impl MemoryDeadlineIndex {
    pub fn contains(&self, attempt_id: &str) -> bool {
        self.entries.lock().unwrap().contains_key(attempt_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[async_trait]
impl DeadlineIndex for MemoryDeadlineIndex {
    async fn schedule(&self, attempt_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        self.entries
            .lock()
            .unwrap()
            .insert(attempt_id.to_string(), deadline);
        Ok(())
    }

    async fn clear(&self, attempt_id: &str) -> Result<()> {
        self.entries.lock().unwrap().remove(attempt_id);
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let mut entries = self.entries.lock().unwrap();
        let mut due: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(id, deadline)| (id.clone(), *deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        due.truncate(limit);
        for (id, _) in &due {
            entries.remove(id);
        }
        Ok(due.into_iter().map(|(id, _)| id).collect())
    }
}

#[derive(Default)]
pub struct MemoryQuizStore {
    quizzes: Mutex<HashMap<String, QuizDoc>>,
}

impl MemoryQuizStore {
    pub fn insert(&self, quiz: QuizDoc) {
        self.quizzes.lock().unwrap().insert(quiz.id.clone(), quiz);
    }
}

#[async_trait]
impl QuizStore for MemoryQuizStore {
    async fn find(&self, quiz_id: &str) -> Result<Option<QuizDoc>> {
        Ok(self.quizzes.lock().unwrap().get(quiz_id).cloned())
    }
}

pub enum BrokerScript {
    Deliver,
    Transient,
    Reject,
}

/// Broker fake: outcomes can be scripted per publish call; the default is
/// successful delivery. Every delivered (topic, key, payload) is recorded.
#[derive(Default)]
pub struct FakeBroker {
    script: Mutex<VecDeque<BrokerScript>>,
    published: Mutex<Vec<(String, String, Value)>>,
}

impl FakeBroker {
    pub fn push_outcome(&self, outcome: BrokerScript) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn published(&self) -> Vec<(String, String, Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerClient for FakeBroker {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
    ) -> std::result::Result<(), PublishError> {
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BrokerScript::Deliver);
        match outcome {
            BrokerScript::Deliver => {
                self.published.lock().unwrap().push((
                    topic.to_string(),
                    partition_key.to_string(),
                    payload.clone(),
                ));
                Ok(())
            }
            BrokerScript::Transient => {
                Err(PublishError::Unavailable(anyhow::anyhow!("broker down")))
            }
            BrokerScript::Reject => Err(PublishError::Rejected("unprocessable event".to_string())),
        }
    }
}

pub struct TestContext {
    pub state: Arc<AppState>,
    pub attempts: Arc<MemoryAttemptStore>,
    pub outbox: Arc<MemoryOutboxStore>,
    pub deadlines: Arc<MemoryDeadlineIndex>,
    pub quizzes: Arc<MemoryQuizStore>,
}

pub fn test_config() -> Config {
    Config {
        mongo_uri: "mongodb://unused".to_string(),
        redis_uri: "redis://unused".to_string(),
        mongo_database: "quizbench_test".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        attempts: AttemptsConfig::default(),
        outbox: OutboxConfig::default(),
    }
}

pub fn build_context() -> TestContext {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let attempts = Arc::new(MemoryAttemptStore::default());
    let outbox = Arc::new(MemoryOutboxStore::default());
    let deadlines = Arc::new(MemoryDeadlineIndex::default());
    let quizzes = Arc::new(MemoryQuizStore::default());

    let state = Arc::new(AppState::from_parts(
        test_config(),
        attempts.clone(),
        quizzes.clone(),
        deadlines.clone(),
        outbox.clone(),
        Arc::new(GradingRegistry::with_builtin()),
    ));

    TestContext {
        state,
        attempts,
        outbox,
        deadlines,
        quizzes,
    }
}

pub fn create_test_app(ctx: &TestContext) -> Router {
    create_router(ctx.state.clone())
}

/// One item worth one point, 30 second total limit.
pub fn short_quiz(id: &str) -> QuizDoc {
    QuizDoc {
        id: id.to_string(),
        root_id: format!("{id}-root"),
        version: 1,
        quiz_type: "standard".to_string(),
        title: "Short quiz".to_string(),
        total_time_limit_seconds: Some(30),
        items: vec![QuizItem {
            id: "i1".to_string(),
            prompt: "6 x 7".to_string(),
            options: None,
            answer_key: json!("42"),
            points: 1,
            time_limit_seconds: None,
        }],
    }
}

pub fn pending_event(id: &str, created_at: DateTime<Utc>) -> OutboxEvent {
    OutboxEvent {
        id: id.to_string(),
        event_type: "AttemptFinalized".to_string(),
        topic: "attempt.finalized".to_string(),
        partition_key: id.to_string(),
        payload: json!({ "data": { "attempt_id": id } }),
        status: OutboxStatus::Pending,
        attempts: 0,
        next_attempt_at: created_at,
        leased_at: None,
        last_error: None,
        created_at,
        published_at: None,
    }
}
