use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{ErrorKind, ServerErrorKind};
use serde_json::Value;
use thiserror::Error;

/// Publish outcomes the outbox publisher needs to tell apart: a rejection is
/// dead-lettered, an unavailable broker is retried with backoff.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("broker rejected event: {0}")]
    Rejected(String),

    #[error("broker unavailable")]
    Unavailable(#[source] anyhow::Error),
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
    ) -> Result<(), PublishError>;
}

/// Redis Streams broker: one stream per topic, the partition key travels as
/// a field so consumers can preserve per-entity order.
pub struct RedisStreamBroker {
    redis: ConnectionManager,
    stream_prefix: String,
}

impl RedisStreamBroker {
    pub fn new(redis: ConnectionManager, stream_prefix: impl Into<String>) -> Self {
        Self {
            redis,
            stream_prefix: stream_prefix.into(),
        }
    }

    fn stream_key(&self, topic: &str) -> String {
        format!("{}:{}", self.stream_prefix, topic)
    }
}

fn classify(err: redis::RedisError) -> PublishError {
    match err.kind() {
        ErrorKind::Io
        | ErrorKind::Server(ServerErrorKind::BusyLoading)
        | ErrorKind::Server(ServerErrorKind::TryAgain)
        | ErrorKind::Server(ServerErrorKind::ClusterDown)
        | ErrorKind::Server(ServerErrorKind::MasterDown) => PublishError::Unavailable(err.into()),
        _ => PublishError::Rejected(err.to_string()),
    }
}

#[async_trait]
impl BrokerClient for RedisStreamBroker {
    async fn publish(
        &self,
        topic: &str,
        partition_key: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let body = serde_json::to_string(payload)
            .map_err(|err| PublishError::Rejected(format!("unserializable payload: {err}")))?;

        let mut conn = self.redis.clone();
        redis::cmd("XADD")
            .arg(self.stream_key(topic))
            .arg("*")
            .arg("key")
            .arg(partition_key)
            .arg("payload")
            .arg(body)
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(classify)
    }
}
