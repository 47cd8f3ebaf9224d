use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::Script;

use super::DeadlineIndex;

/// Remove-and-return of due members in one round trip, so concurrently
/// ticking worker replicas do not hand out the same attempt twice.
const CLAIM_DUE_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
if #due > 0 then
    redis.call('ZREM', KEYS[1], unpack(due))
end
return due
"#;

/// Sorted-set deadline index: member = attempt id, score = deadline millis.
pub struct RedisDeadlineIndex {
    redis: ConnectionManager,
    key: String,
    claim_script: Script,
}

impl RedisDeadlineIndex {
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
            claim_script: Script::new(CLAIM_DUE_SCRIPT),
        }
    }
}

#[async_trait]
impl DeadlineIndex for RedisDeadlineIndex {
    async fn schedule(&self, attempt_id: &str, deadline: DateTime<Utc>) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("ZADD")
            .arg(&self.key)
            .arg(deadline.timestamp_millis())
            .arg(attempt_id)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to schedule deadline")?;
        Ok(())
    }

    async fn clear(&self, attempt_id: &str) -> Result<()> {
        let mut conn = self.redis.clone();
        redis::cmd("ZREM")
            .arg(&self.key)
            .arg(attempt_id)
            .query_async::<()>(&mut conn)
            .await
            .context("Failed to clear deadline")?;
        Ok(())
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<String>> {
        let mut conn = self.redis.clone();
        let due: Vec<String> = self
            .claim_script
            .key(&self.key)
            .arg(now.timestamp_millis())
            .arg(limit as i64)
            .invoke_async(&mut conn)
            .await
            .context("Failed to claim due deadlines")?;
        Ok(due)
    }
}
