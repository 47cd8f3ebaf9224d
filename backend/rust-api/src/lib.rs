use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub mod broker;
pub mod config;
pub mod error;
pub mod grading;
pub mod handlers;
pub mod metrics;
pub mod middlewares;
pub mod models;
pub mod services;
pub mod stores;
pub mod utils;

pub use config::Config;
pub use services::AppState;

pub fn create_router(app_state: std::sync::Arc<services::AppState>) -> Router {
    Router::new()
        // Public endpoints (no auth required)
        .route("/health", get(handlers::health_check))
        // Metrics endpoint with Basic Auth protection
        .route(
            "/metrics",
            get(handlers::metrics_handler)
                .layer(middleware::from_fn(handlers::metrics_auth_middleware)),
        )
        .nest("/api/v1/attempts", attempts_routes())
        .nest("/internal", internal_routes())
        .with_state(app_state)
        .layer(middleware::from_fn(
            middlewares::metrics::metrics_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}

fn attempts_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new()
        .route("/", post(handlers::attempts::start_attempt))
        .route("/{id}", get(handlers::attempts::get_attempt))
        .route("/{id}/answers", post(handlers::attempts::submit_answers))
        .route("/{id}/finish", post(handlers::attempts::finish_attempt))
}

/// Operator and upstream-service surface; deployments front this with
/// network policy rather than end-user auth.
fn internal_routes() -> Router<std::sync::Arc<services::AppState>> {
    Router::new()
        .route(
            "/quizzes/{id}/invalidate-attempts",
            post(handlers::attempts::invalidate_quiz_attempts),
        )
        .route("/outbox/dead", get(handlers::attempts::list_dead_events))
        .route(
            "/outbox/{id}/requeue",
            post(handlers::attempts::requeue_dead_event),
        )
}
