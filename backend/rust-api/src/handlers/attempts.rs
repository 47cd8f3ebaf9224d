use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::{
    error::CoreError,
    models::attempt::{AttemptView, FinalizeTrigger, StartAttemptRequest, SubmitAnswersRequest},
    services::AppState,
    stores::OutboxStore,
};

pub async fn start_attempt(
    State(state): State<Arc<AppState>>,
    Json(req): Json<StartAttemptRequest>,
) -> Result<impl IntoResponse, CoreError> {
    tracing::info!(
        quiz_id = %req.quiz_id,
        student_id = %req.student_id,
        schedule_id = %req.schedule_id,
        "Starting attempt"
    );

    let outcome = state.attempts.start(req).await?;
    let status = if outcome.resumed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(AttemptView::from(outcome.attempt))))
}

pub async fn get_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let attempt = state.attempts.get(&attempt_id).await?;
    Ok(Json(AttemptView::from(attempt)))
}

pub async fn submit_answers(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
    Json(req): Json<SubmitAnswersRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let attempt = state.attempts.submit_answers(&attempt_id, req).await?;
    Ok(Json(AttemptView::from(attempt)))
}

/// A finish that lost the race to the expiry worker still succeeds and
/// returns the already-finalized result.
pub async fn finish_attempt(
    State(state): State<Arc<AppState>>,
    Path(attempt_id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let attempt = state
        .attempts
        .finalize(&attempt_id, FinalizeTrigger::Manual)
        .await?;
    Ok(Json(AttemptView::from(attempt)))
}

#[derive(Debug, Deserialize)]
pub struct InvalidateAttemptsRequest {
    pub reason: Option<String>,
}

pub async fn invalidate_quiz_attempts(
    State(state): State<Arc<AppState>>,
    Path(quiz_id): Path<String>,
    Json(req): Json<InvalidateAttemptsRequest>,
) -> Result<impl IntoResponse, CoreError> {
    let reason = req.reason.as_deref().unwrap_or("quiz_replaced");
    let invalidated = state.attempts.invalidate_for_quiz(&quiz_id, reason).await?;
    Ok(Json(json!({ "invalidated": invalidated })))
}

#[derive(Debug, Deserialize)]
pub struct DeadEventsQuery {
    pub limit: Option<i64>,
}

pub async fn list_dead_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeadEventsQuery>,
) -> Result<impl IntoResponse, CoreError> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let events = state.outbox.list_dead(limit).await?;
    Ok(Json(events))
}

pub async fn requeue_dead_event(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<impl IntoResponse, CoreError> {
    let requeued = state
        .outbox
        .requeue_dead(&event_id, chrono::Utc::now())
        .await?;
    if !requeued {
        return Err(CoreError::not_found("dead outbox event", event_id));
    }
    Ok(StatusCode::NO_CONTENT)
}
