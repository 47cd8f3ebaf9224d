use tracing_subscriber::fmt::init;

use quizbench_api::{
    config::Config,
    services::{expiry_worker::ExpiryWorker, AppState},
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

    let worker = ExpiryWorker::new(
        app_state.deadlines.clone(),
        app_state.attempts.clone(),
        config.attempts,
    );

    worker.run().await?;

    Ok(())
}
