use chrono::Duration;
use serde_json::json;

use quizbench_api::error::CoreError;
use quizbench_api::grading::GradingRegistry;
use quizbench_api::models::attempt::{
    AttemptState, FinalizeTrigger, StartAttemptRequest, SubmitAnswersRequest,
};
use quizbench_api::services::expiry_worker::ExpiryWorker;

mod common;

fn start_request(quiz_id: &str, student_id: &str, schedule_id: &str) -> StartAttemptRequest {
    StartAttemptRequest {
        quiz_id: quiz_id.to_string(),
        student_id: student_id.to_string(),
        class_id: Some("class-1".to_string()),
        schedule_id: schedule_id.to_string(),
        schedule_closes_at: None,
    }
}

fn submit(answers: serde_json::Value, expected_version: Option<i64>) -> SubmitAnswersRequest {
    SubmitAnswersRequest {
        answers: serde_json::from_value(answers).unwrap(),
        expected_version,
    }
}

#[tokio::test]
async fn start_resumes_existing_in_progress_attempt() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let first = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    assert!(!first.resumed);
    assert_eq!(first.attempt.state, AttemptState::InProgress);
    assert!(ctx.deadlines.contains(&first.attempt.id));

    let second = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    assert!(second.resumed);
    assert_eq!(second.attempt.id, first.attempt.id);
    assert_eq!(second.attempt.attempt_version, first.attempt.attempt_version);

    // A different schedule gets its own attempt.
    let other = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-2"))
        .await
        .unwrap();
    assert_ne!(other.attempt.id, first.attempt.id);
}

#[tokio::test]
async fn start_with_unknown_quiz_is_not_found() {
    let ctx = common::build_context();
    let err = ctx
        .state
        .attempts
        .start(start_request("missing", "student-1", "sched-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::NotFound { .. }));
}

#[tokio::test]
async fn submit_merges_answers_per_key() {
    let ctx = common::build_context();
    let mut quiz = common::short_quiz("quiz-1");
    quiz.items.push(quizbench_api::models::quiz::QuizItem {
        id: "i2".to_string(),
        prompt: "2 + 2".to_string(),
        options: None,
        answer_key: json!("4"),
        points: 1,
        time_limit_seconds: None,
    });
    ctx.quizzes.insert(quiz);

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();

    let after_first = ctx
        .state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": "41" }), None))
        .await
        .unwrap();
    assert_eq!(after_first.attempt_version, 2);
    assert!(after_first.last_saved_at.is_some());

    // Second write touches i2 and overwrites i1; untouched keys survive.
    let after_second = ctx
        .state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": "42", "i2": "4" }), Some(2)))
        .await
        .unwrap();
    assert_eq!(after_second.attempt_version, 3);
    assert_eq!(after_second.answers["i1"], json!("42"));
    assert_eq!(after_second.answers["i2"], json!("4"));
}

#[tokio::test]
async fn stale_expected_version_conflicts_and_leaves_answers_unchanged() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();

    ctx.state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": "42" }), Some(1)))
        .await
        .unwrap();

    let err = ctx
        .state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": "13" }), Some(1)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoreError::VersionConflict {
            expected: 1,
            stored: 2
        }
    ));

    let stored = ctx.attempts.get(&id).unwrap();
    assert_eq!(stored.answers["i1"], json!("42"));
    assert_eq!(stored.attempt_version, 2);
}

#[tokio::test]
async fn submitting_bad_item_ids_is_rejected() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));
    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();

    let err = ctx
        .state
        .attempts
        .submit_answers(&started.attempt.id, submit(json!({ "a.b": "x" }), None))
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::Validation(_)));
}

#[tokio::test]
async fn concurrent_finalize_persists_one_score_and_one_event() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();

    ctx.state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": "42" }), None))
        .await
        .unwrap();
    let version_before = ctx.attempts.get(&id).unwrap().attempt_version;

    let mut handles = Vec::new();
    for n in 0..6 {
        let service = ctx.state.attempts.clone();
        let id = id.clone();
        let trigger = if n % 2 == 0 {
            FinalizeTrigger::Manual
        } else {
            FinalizeTrigger::Expiry
        };
        handles.push(tokio::spawn(
            async move { service.finalize(&id, trigger).await },
        ));
    }

    for handle in handles {
        let attempt = handle.await.unwrap().unwrap();
        assert_eq!(attempt.state, AttemptState::Finalized);
        assert_eq!(attempt.score, Some(1));
        assert_eq!(attempt.max_score, Some(1));
    }

    let stored = ctx.attempts.get(&id).unwrap();
    assert_eq!(stored.attempt_version, version_before + 1);

    let events = ctx.outbox.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, format!("attempt:{id}:finalized"));
    assert!(!ctx.deadlines.contains(&id));
}

#[tokio::test]
async fn expiry_finalizes_with_last_saved_answers_and_manual_finish_observes_it() {
    // One item worth 1 point, 30s total limit; the student never answers.
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();
    let deadline = started.attempt.deadline_at;

    let worker = ExpiryWorker::new(
        ctx.deadlines.clone(),
        ctx.state.attempts.clone(),
        ctx.state.config.attempts.clone(),
    );

    // Tick before the deadline claims nothing.
    let finalized = worker
        .run_once(deadline - Duration::seconds(5))
        .await
        .unwrap();
    assert_eq!(finalized, 0);

    let finalized = worker
        .run_once(deadline + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(finalized, 1);

    let expired = ctx.attempts.get(&id).unwrap();
    assert_eq!(expired.state, AttemptState::Finalized);
    assert_eq!(expired.score, Some(0));
    assert_eq!(expired.max_score, Some(1));
    assert_eq!(expired.finalize_trigger, Some(FinalizeTrigger::Expiry));
    let finished_at = expired.finished_at;

    // A manual finish arriving after expiry succeeds and observes the
    // stored 0/1 result without re-scoring.
    let observed = ctx
        .state
        .attempts
        .finalize(&id, FinalizeTrigger::Manual)
        .await
        .unwrap();
    assert_eq!(observed.score, Some(0));
    assert_eq!(observed.finalize_trigger, Some(FinalizeTrigger::Expiry));
    assert_eq!(observed.finished_at, finished_at);

    assert_eq!(ctx.outbox.events().len(), 1);
}

#[tokio::test]
async fn regrading_the_stored_snapshot_reproduces_the_persisted_score() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();

    ctx.state
        .attempts
        .submit_answers(&id, submit(json!({ "i1": " 42 " }), None))
        .await
        .unwrap();
    ctx.state
        .attempts
        .finalize(&id, FinalizeTrigger::Manual)
        .await
        .unwrap();

    let stored = ctx.attempts.get(&id).unwrap();
    let registry = GradingRegistry::with_builtin();
    let strategy = registry.resolve(&stored.snapshot.quiz_type).unwrap();
    let regraded = strategy.grade(&stored.snapshot, &stored.answers);

    assert_eq!(Some(regraded.total), stored.score);
    assert_eq!(Some(regraded.max), stored.max_score);
    assert_eq!(regraded.breakdown, stored.breakdown);
}

#[tokio::test]
async fn invalidate_is_idempotent_and_blocks_manual_finish() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let started = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let id = started.attempt.id.clone();

    let invalidated = ctx
        .state
        .attempts
        .invalidate(&id, "quiz_replaced")
        .await
        .unwrap();
    assert_eq!(invalidated.state, AttemptState::Invalidated);
    assert!(!ctx.deadlines.contains(&id));

    let again = ctx
        .state
        .attempts
        .invalidate(&id, "quiz_replaced")
        .await
        .unwrap();
    assert_eq!(again.attempt_version, invalidated.attempt_version);

    let err = ctx
        .state
        .attempts
        .finalize(&id, FinalizeTrigger::Manual)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::StateConflict { .. }));

    // The expiry sweep treats the same situation as a benign no-op.
    let swept = ctx
        .state
        .attempts
        .finalize(&id, FinalizeTrigger::Expiry)
        .await
        .unwrap();
    assert_eq!(swept.state, AttemptState::Invalidated);

    let events = ctx.outbox.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, format!("attempt:{id}:invalidated"));
}

#[tokio::test]
async fn quiz_invalidation_cascade_sweeps_in_progress_attempts() {
    let ctx = common::build_context();
    ctx.quizzes.insert(common::short_quiz("quiz-1"));

    let a = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-1", "sched-1"))
        .await
        .unwrap();
    let b = ctx
        .state
        .attempts
        .start(start_request("quiz-1", "student-2", "sched-1"))
        .await
        .unwrap();

    // A finalized attempt is left alone by the cascade.
    ctx.state
        .attempts
        .finalize(&b.attempt.id, FinalizeTrigger::Manual)
        .await
        .unwrap();

    let invalidated = ctx
        .state
        .attempts
        .invalidate_for_quiz("quiz-1", "quiz_deleted")
        .await
        .unwrap();
    assert_eq!(invalidated, 1);

    assert_eq!(
        ctx.attempts.get(&a.attempt.id).unwrap().state,
        AttemptState::Invalidated
    );
    assert_eq!(
        ctx.attempts.get(&b.attempt.id).unwrap().state,
        AttemptState::Finalized
    );
}
