use std::sync::Arc;

use tracing_subscriber::fmt::init;

use quizbench_api::{
    broker::RedisStreamBroker,
    config::Config,
    services::{outbox_publisher::OutboxPublisher, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let config = Config::load().expect("Failed to load configuration");

    let mongo_client = mongodb::Client::with_uri_str(&config.mongo_uri)
        .await
        .expect("Failed to connect to MongoDB");

    let redis_client =
        redis::Client::open(config.redis_uri.clone()).expect("Failed to create Redis client");

    let app_state = AppState::new(config.clone(), mongo_client, redis_client)
        .await
        .expect("Failed to initialize app state");

    let redis = app_state
        .redis
        .clone()
        .expect("Redis must be configured for the outbox publisher");
    let broker = Arc::new(RedisStreamBroker::new(
        redis,
        config.outbox.stream_prefix.clone(),
    ));

    let publisher = OutboxPublisher::new(app_state.outbox.clone(), broker, config.outbox);

    publisher.run().await?;

    Ok(())
}
