use std::sync::Arc;

use mongodb::{Client as MongoClient, Database};
use redis::aio::ConnectionManager;

use crate::config::Config;
use crate::grading::GradingRegistry;
use crate::services::attempt_service::AttemptService;
use crate::services::event_emitter::EventEmitter;
use crate::stores::{
    AttemptStore, DeadlineIndex, MongoAttemptStore, MongoOutboxStore, MongoQuizStore, OutboxStore,
    QuizStore, RedisDeadlineIndex,
};

pub mod attempt_service;
pub mod event_emitter;
pub mod expiry_worker;
pub mod outbox_publisher;

/// Shared application state. Client handles are constructed explicitly and
/// injected, so tests and alternate deployments can swap the store seams.
pub struct AppState {
    pub config: Config,
    pub attempts: Arc<AttemptService>,
    pub deadlines: Arc<dyn DeadlineIndex>,
    pub outbox: Arc<dyn OutboxStore>,
    /// Raw handles kept for dependency health probes; absent when the state
    /// was assembled from injected stores.
    pub mongo: Option<Database>,
    pub redis: Option<ConnectionManager>,
}

impl AppState {
    pub async fn new(
        config: Config,
        mongo_client: MongoClient,
        redis_client: redis::Client,
    ) -> anyhow::Result<Self> {
        let mongo = mongo_client.database(&config.mongo_database);

        tracing::info!("Attempting to connect to Redis...");

        let redis = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            ConnectionManager::new(redis_client),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis connection timeout after 30s"))??;

        tracing::info!("Redis ConnectionManager created, testing with PING...");

        let mut conn = redis.clone();
        tokio::time::timeout(
            std::time::Duration::from_secs(5),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow::anyhow!("Redis PING timeout after 5s"))??;

        tracing::info!("Redis connection established successfully");

        let attempt_store = Arc::new(MongoAttemptStore::new(&mongo));
        attempt_store.ensure_indexes().await?;
        let outbox_store = Arc::new(MongoOutboxStore::new(&mongo));
        outbox_store.ensure_indexes().await?;
        let quiz_store = Arc::new(MongoQuizStore::new(&mongo));
        let deadlines = Arc::new(RedisDeadlineIndex::new(
            redis.clone(),
            config.attempts.deadline_key.clone(),
        ));

        let mut state = Self::from_parts(
            config,
            attempt_store,
            quiz_store,
            deadlines,
            outbox_store,
            Arc::new(GradingRegistry::with_builtin()),
        );
        state.mongo = Some(mongo);
        state.redis = Some(redis);
        Ok(state)
    }

    pub fn from_parts(
        config: Config,
        attempt_store: Arc<dyn AttemptStore>,
        quiz_store: Arc<dyn QuizStore>,
        deadlines: Arc<dyn DeadlineIndex>,
        outbox: Arc<dyn OutboxStore>,
        registry: Arc<GradingRegistry>,
    ) -> Self {
        let emitter = EventEmitter::new(outbox.clone());
        let attempts = Arc::new(AttemptService::new(
            attempt_store,
            quiz_store,
            deadlines.clone(),
            emitter,
            registry,
            config.attempts.clone(),
        ));

        Self {
            config,
            attempts,
            deadlines,
            outbox,
            mongo: None,
            redis: None,
        }
    }
}
