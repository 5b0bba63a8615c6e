//! Work queue over Redis.
//!
//! Layout for queue `q`:
//!
//! | key | type | contents |
//! |---|---|---|
//! | `q:seq` | string | job id counter |
//! | `q:jobs` | hash | id → payload |
//! | `q:ready` | list | ids ready for reservation, FIFO |
//! | `q:delayed` | zset | id scored by due time (epoch ms) |
//! | `q:reserved` | zset | id scored by lease deadline (epoch ms) |
//!
//! Every state change is a single Lua script so concurrent workers never
//! observe a half-moved job. Scripts read the clock with `TIME` so all
//! clients share the server's notion of now.

use super::{Connection, Connector, DEFAULT_LEASE, DIAL_TIMEOUT};
use crate::error::QueueError;
use crate::job::{Job, JobId};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use redis::Script;
use redis::aio::MultiplexedConnection;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

static RESERVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local t = redis.call('TIME')
        local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)

        local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
        for _, id in ipairs(due) do
            redis.call('ZREM', KEYS[2], id)
            redis.call('RPUSH', KEYS[1], id)
        end

        local expired = redis.call('ZRANGEBYSCORE', KEYS[3], '-inf', now)
        for _, id in ipairs(expired) do
            redis.call('ZREM', KEYS[3], id)
            redis.call('LPUSH', KEYS[1], id)
        end

        while true do
            local id = redis.call('LPOP', KEYS[1])
            if not id then
                return false
            end
            local body = redis.call('HGET', KEYS[4], id)
            if body then
                redis.call('ZADD', KEYS[3], now + tonumber(ARGV[1]), id)
                return {tonumber(id), body}
            end
        end
        ",
    )
});

static ACKNOWLEDGE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        redis.call('HDEL', KEYS[2], ARGV[1])
        return 1
        ",
    )
});

static RELEASE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        local delay = tonumber(ARGV[2])
        if delay <= 0 then
            redis.call('RPUSH', KEYS[3], ARGV[1])
            return 1
        end
        local t = redis.call('TIME')
        local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
        redis.call('ZADD', KEYS[2], now + delay, ARGV[1])
        return 1
        ",
    )
});

static PUBLISH: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r"
        local id = redis.call('INCR', KEYS[1])
        redis.call('HSET', KEYS[2], id, ARGV[1])
        redis.call('RPUSH', KEYS[3], id)
        return id
        ",
    )
});

/// Key names for one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub seq: String,
    pub jobs: String,
    pub ready: String,
    pub delayed: String,
    pub reserved: String,
}

impl QueueKeys {
    pub fn new(queue: &str) -> Self {
        Self {
            seq: format!("{queue}:seq"),
            jobs: format!("{queue}:jobs"),
            ready: format!("{queue}:ready"),
            delayed: format!("{queue}:delayed"),
            reserved: format!("{queue}:reserved"),
        }
    }
}

/// Dials [`RedisConnection`]s
#[derive(Debug, Clone)]
pub struct RedisConnector {
    lease: Duration,
    poll_interval: Duration,
}

impl RedisConnector {
    pub fn new() -> Self {
        Self {
            lease: DEFAULT_LEASE,
            poll_interval: Duration::from_millis(100),
        }
    }

    /// Reservation lease; a job not settled within it is redelivered.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Interval between reservation polls while the queue is empty.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(1));
        self
    }
}

impl Default for RedisConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for RedisConnector {
    type Connection = RedisConnection;

    async fn connect(&self, address: &str, queue: &str) -> Result<RedisConnection, QueueError> {
        info!(address = %address, queue = %queue, "Connecting to Redis");

        let client = redis::Client::open(address).map_err(|e| QueueError::connect(address, e))?;
        let conn = tokio::time::timeout(DIAL_TIMEOUT, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| {
                QueueError::connect(address, format!("dial timed out after {DIAL_TIMEOUT:?}"))
            })?
            .map_err(|e| QueueError::connect(address, e))?;

        Ok(RedisConnection {
            conn: Some(conn),
            keys: QueueKeys::new(queue),
            lease: self.lease,
            poll_interval: self.poll_interval,
        })
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Session on a Redis work queue
pub struct RedisConnection {
    conn: Option<MultiplexedConnection>,
    keys: QueueKeys,
    lease: Duration,
    poll_interval: Duration,
}

impl RedisConnection {
    fn conn(&mut self) -> Result<&mut MultiplexedConnection, QueueError> {
        self.conn.as_mut().ok_or(QueueError::Disconnected)
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.keys
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn reserve(&mut self, timeout: Duration) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + timeout;
        let lease_ms = self.lease.as_millis() as u64;

        loop {
            let keys = self.keys.clone();
            let reserved: Option<(u64, Vec<u8>)> = RESERVE
                .key(&keys.ready)
                .key(&keys.delayed)
                .key(&keys.reserved)
                .key(&keys.jobs)
                .arg(lease_ms)
                .invoke_async(self.conn()?)
                .await?;

            if let Some((id, payload)) = reserved {
                return Ok(Some(Job::new(id, payload)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&mut self, id: JobId) -> Result<(), QueueError> {
        let keys = self.keys.clone();
        let removed: i64 = ACKNOWLEDGE
            .key(&keys.reserved)
            .key(&keys.jobs)
            .arg(id.get())
            .invoke_async(self.conn()?)
            .await?;

        if removed == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn release(&mut self, id: JobId, delay: Duration) -> Result<(), QueueError> {
        let keys = self.keys.clone();
        let moved: i64 = RELEASE
            .key(&keys.reserved)
            .key(&keys.delayed)
            .key(&keys.ready)
            .arg(id.get())
            .arg(delay.as_millis() as u64)
            .invoke_async(self.conn()?)
            .await?;

        if moved == 0 {
            return Err(QueueError::NotFound(id));
        }
        Ok(())
    }

    async fn publish(&mut self, queue: &str, payload: &[u8]) -> Result<(), QueueError> {
        let keys = QueueKeys::new(queue);
        let id: u64 = PUBLISH
            .key(&keys.seq)
            .key(&keys.jobs)
            .key(&keys.ready)
            .arg(payload)
            .invoke_async(self.conn()?)
            .await?;

        debug!(queue = %queue, job_id = id, "Published job");
        Ok(())
    }

    async fn close(&mut self) {
        if self.conn.take().is_some() {
            debug!(queue = %self.keys.ready, "Redis connection closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_keys() {
        let keys = QueueKeys::new("mail");
        assert_eq!(keys.seq, "mail:seq");
        assert_eq!(keys.jobs, "mail:jobs");
        assert_eq!(keys.ready, "mail:ready");
        assert_eq!(keys.delayed, "mail:delayed");
        assert_eq!(keys.reserved, "mail:reserved");
    }

    #[test]
    fn test_connector_builder() {
        let connector = RedisConnector::new()
            .with_lease(Duration::from_secs(30))
            .with_poll_interval(Duration::ZERO);
        assert_eq!(connector.lease, Duration::from_secs(30));
        assert_eq!(connector.poll_interval, Duration::from_millis(1));
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let err = RedisConnector::new()
            .connect("not-a-redis-url", "mail")
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            QueueError::Connect { ref address, .. } if address == "not-a-redis-url"
        ));
    }

    #[tokio::test]
    #[ignore] // Requires actual Redis
    async fn test_reserve_roundtrip() {
        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
        let queue = format!("test:{}", uuid::Uuid::new_v4());

        let mut conn = RedisConnector::new().connect(&redis_url, &queue).await.unwrap();
        conn.publish(&queue, b"hello").await.unwrap();

        let job = conn.reserve(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(job.payload, b"hello");
        conn.acknowledge(job.id).await.unwrap();
        assert!(conn.acknowledge(job.id).await.unwrap_err().is_not_found());
    }
}
