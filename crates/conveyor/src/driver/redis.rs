use super::Driver;
use crate::clock::Clock;
use crate::envelope::{after, Envelope};
use crate::error::{QueueError, Result};
use crate::registry::ConnectorContext;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_PREFIX: &str = "queues";

/// Move expired leases back to pending, then claim the oldest visible job.
///
/// KEYS: pending, reserved, jobs, attempts. ARGV: now, lease expiry.
const LEASE_SCRIPT: &str = r#"
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'WITHSCORES')
for i = 1, #expired, 2 do
    redis.call('ZREM', KEYS[2], expired[i])
    redis.call('ZADD', KEYS[1], expired[i + 1], expired[i])
end

local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
if #ids == 0 then
    return false
end

local id = ids[1]
redis.call('ZREM', KEYS[1], id)
local body = redis.call('HGET', KEYS[3], id)
if not body then
    return false
end

redis.call('ZADD', KEYS[2], ARGV[2], id)
local attempts = redis.call('HINCRBY', KEYS[4], id, 1)
return {id, body, attempts}
"#;

/// KEYS: pending, reserved, jobs. ARGV: id, available at, body.
const RELEASE_SCRIPT: &str = r#"
if redis.call('HEXISTS', KEYS[3], ARGV[1]) == 0 then
    return 0
end
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
redis.call('HSET', KEYS[3], ARGV[1], ARGV[3])
return 1
"#;

/// KEYS: pending, reserved, jobs, attempts. ARGV: id.
const REMOVE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
redis.call('HDEL', KEYS[4], ARGV[1])
return 1
"#;

/// Redis-backed queue
///
/// Uses Redis data structures:
/// - `{prefix}:{queue}` - sorted set of waiting job ids (score = available_at ms)
/// - `{prefix}:{queue}:reserved` - sorted set of leased ids (score = lease expiry ms)
/// - `{prefix}:jobs` - hash of job id to envelope JSON
/// - `{prefix}:attempts` - hash of job id to lease count
///
/// Ids are UUIDv7, so members with equal scores sort in enqueue order.
#[derive(Clone)]
pub struct RedisDriver {
    connection: String,
    queue: String,
    retry_after: Duration,
    prefix: String,
    conn: MultiplexedConnection,
    clock: Arc<dyn Clock>,
    lease_script: Script,
    release_script: Script,
    remove_script: Script,
}

impl RedisDriver {
    pub async fn connect(
        connection: &str,
        url: &str,
        prefix: &str,
        queue: &str,
        retry_after: Duration,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let client = Client::open(url).map_err(|e| QueueError::Configuration(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        Ok(Self {
            connection: connection.to_string(),
            queue: queue.to_string(),
            retry_after,
            prefix: prefix.to_string(),
            conn,
            clock,
            lease_script: Script::new(LEASE_SCRIPT),
            release_script: Script::new(RELEASE_SCRIPT),
            remove_script: Script::new(REMOVE_SCRIPT),
        })
    }

    fn pending_key(&self, queue: &str) -> String {
        format!("{}:{}", self.prefix, queue)
    }

    fn reserved_key(&self, queue: &str) -> String {
        format!("{}:{}:reserved", self.prefix, queue)
    }

    fn jobs_key(&self) -> String {
        format!("{}:jobs", self.prefix)
    }

    fn attempts_key(&self) -> String {
        format!("{}:attempts", self.prefix)
    }

    /// Check the server is answering
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn stored(&self, id: &str) -> Result<Option<Envelope>> {
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("HGET")
            .arg(self.jobs_key())
            .arg(id)
            .query_async(&mut conn)
            .await?;

        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    fn push_command(&self, pipe: &mut redis::Pipeline, envelope: &Envelope) -> Result<()> {
        let body = serde_json::to_string(envelope)?;
        pipe.cmd("HSET")
            .arg(self.jobs_key())
            .arg(&envelope.id)
            .arg(body)
            .ignore()
            .cmd("ZADD")
            .arg(self.pending_key(&envelope.queue))
            .arg(score(envelope.available_at))
            .arg(&envelope.id)
            .ignore();
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let Some(envelope) = self.stored(id).await? else {
            return Ok(());
        };

        let mut conn = self.conn.clone();
        let _: i64 = self
            .remove_script
            .key(self.pending_key(&envelope.queue))
            .key(self.reserved_key(&envelope.queue))
            .key(self.jobs_key())
            .key(self.attempts_key())
            .arg(id)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }
}

/// Score for a deadline, rounded up so a job never becomes visible early
fn score(at: DateTime<Utc>) -> i64 {
    let millis = at.timestamp_millis();
    if at.timestamp_subsec_nanos() % 1_000_000 == 0 {
        millis
    } else {
        millis + 1
    }
}

/// Score for the current instant, truncated
fn now_score(now: DateTime<Utc>) -> i64 {
    now.timestamp_millis()
}

/// Connector for the `redis` driver type.
///
/// Options: `url` (required), `prefix` (default `queues`).
pub async fn connect(ctx: ConnectorContext) -> Result<Arc<dyn Driver>> {
    let url = ctx.config.require_str("url")?;
    let prefix = ctx.config.option_str("prefix").unwrap_or(DEFAULT_PREFIX);

    let driver = RedisDriver::connect(
        &ctx.name,
        url,
        prefix,
        &ctx.config.queue,
        ctx.config.retry_after_duration(),
        ctx.clock.clone(),
    )
    .await?;

    Ok(Arc::new(driver))
}

#[async_trait]
impl Driver for RedisDriver {
    fn connection_name(&self) -> &str {
        &self.connection
    }

    fn driver_type(&self) -> &'static str {
        "redis"
    }

    fn default_queue(&self) -> &str {
        &self.queue
    }

    fn retry_after(&self) -> Duration {
        self.retry_after
    }

    async fn enqueue(&self, envelope: Envelope) -> Result<String> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        self.push_command(&mut pipe, &envelope)?;

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(envelope.id)
    }

    async fn enqueue_batch(&self, envelopes: Vec<Envelope>) -> Result<Vec<String>> {
        if envelopes.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for envelope in &envelopes {
            self.push_command(&mut pipe, envelope)?;
        }

        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;

        Ok(envelopes.into_iter().map(|e| e.id).collect())
    }

    async fn dequeue_lease(&self, queue: &str, lease: Duration) -> Result<Option<Envelope>> {
        let now = self.clock.now();
        let reserved_until = after(now, lease);

        let mut conn = self.conn.clone();
        let claimed: Option<(String, String, i64)> = self
            .lease_script
            .key(self.pending_key(queue))
            .key(self.reserved_key(queue))
            .key(self.jobs_key())
            .key(self.attempts_key())
            .arg(now_score(now))
            .arg(score(reserved_until))
            .invoke_async(&mut conn)
            .await?;

        let Some((id, body, attempts)) = claimed else {
            return Ok(None);
        };

        let mut envelope: Envelope = serde_json::from_str(&body)?;
        envelope.id = id;
        envelope.attempts = attempts.max(0) as u32;
        envelope.reserved_until = Some(reserved_until);

        Ok(Some(envelope))
    }

    async fn acknowledge(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn release(&self, id: &str, delay: Duration) -> Result<()> {
        let Some(mut envelope) = self.stored(id).await? else {
            return Ok(());
        };
        envelope.available_at = after(self.clock.now(), delay);
        envelope.reserved_until = None;
        let body = serde_json::to_string(&envelope)?;

        let mut conn = self.conn.clone();
        let _: i64 = self
            .release_script
            .key(self.pending_key(&envelope.queue))
            .key(self.reserved_key(&envelope.queue))
            .key(self.jobs_key())
            .arg(id)
            .arg(score(envelope.available_at))
            .arg(body)
            .invoke_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.remove(id).await
    }

    async fn size(&self, queue: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let (pending, reserved): (usize, usize) = redis::pipe()
            .cmd("ZCARD")
            .arg(self.pending_key(queue))
            .cmd("ZCARD")
            .arg(self.reserved_key(queue))
            .query_async(&mut conn)
            .await?;

        Ok(pending + reserved)
    }
}
