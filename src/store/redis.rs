//! Redis-backed counter store.
//!
//! All workers pointing at the same Redis share counters. The bounded
//! increment and the floored decrement run as Lua scripts so each is a single
//! atomic step on the server.

use std::future::Future;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{Client, RedisResult, Script};
use async_trait::async_trait;
use tracing::{debug, info};

use super::{Admission, SharedCounterStore};
use crate::error::{GateError, Result};

/// INCR unless that would pass ARGV[1]; refresh the TTL (ms, ARGV[2]) of any surviving key.
const INCREMENT_WITHIN: &str = r#"
local value = redis.call('INCR', KEYS[1])
local ttl = tonumber(ARGV[2])
if value > tonumber(ARGV[1]) then
    if value == 1 then
        redis.call('DEL', KEYS[1])
        return {0, 0}
    end
    redis.call('DECR', KEYS[1])
    if ttl > 0 then
        redis.call('PEXPIRE', KEYS[1], ttl)
    end
    return {0, value - 1}
end
if ttl > 0 then
    redis.call('PEXPIRE', KEYS[1], ttl)
end
return {1, value}
"#;

/// DECR unless the counter is already at (or below) zero; -1 signals underflow.
const DECREMENT_FLOORED: &str = r#"
local value = tonumber(redis.call('GET', KEYS[1]) or '0')
if value <= 0 then
    return -1
end
return redis.call('DECR', KEYS[1])
"#;

/// Counter store backed by a Redis server.
pub struct RedisStore {
    conn: ConnectionManager,
    op_timeout: Duration,
    increment_within: Script,
    decrement_floored: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("op_timeout", &self.op_timeout)
            .finish()
    }
}

impl RedisStore {
    /// Connect to `url`, failing with `StoreUnavailable` if the server cannot
    /// be reached within `op_timeout`.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self> {
        let client = Client::open(url)
            .map_err(|e| GateError::Config(format!("Invalid redis url: {}", e)))?;

        let conn = tokio::time::timeout(op_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                GateError::StoreUnavailable(format!(
                    "timed out after {:?} connecting to redis",
                    op_timeout
                ))
            })??;

        info!(op_timeout = ?op_timeout, "Connected to redis counter store");

        Ok(Self {
            conn,
            op_timeout,
            increment_within: Script::new(INCREMENT_WITHIN),
            decrement_floored: Script::new(DECREMENT_FLOORED),
        })
    }

    /// Run one redis operation under the configured timeout.
    async fn run<T, F>(&self, op: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>> + Send,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result.map_err(|e| {
                debug!(op, error = %e, "Redis operation failed");
                GateError::from(e)
            }),
            Err(_) => Err(GateError::StoreUnavailable(format!(
                "redis {} timed out after {:?}",
                op, self.op_timeout
            ))),
        }
    }
}

fn to_count(value: i64) -> u64 {
    value.max(0) as u64
}

#[async_trait]
impl SharedCounterStore for RedisStore {
    fn backend_name(&self) -> &'static str {
        "redis"
    }

    async fn increment(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .run("INCR", ::redis::cmd("INCR").arg(key).query_async(&mut conn))
            .await?;
        Ok(to_count(value))
    }

    async fn decrement(&self, key: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let value: i64 = self
            .run(
                "DECR",
                self.decrement_floored.key(key).invoke_async(&mut conn),
            )
            .await?;
        if value < 0 {
            return Err(GateError::CounterUnderflow(key.to_string()));
        }
        Ok(to_count(value))
    }

    async fn get(&self, key: &str) -> Result<Option<u64>> {
        let mut conn = self.conn.clone();
        let value: Option<i64> = self
            .run("GET", ::redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value.map(to_count))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run(
                "PEXPIRE",
                ::redis::cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .run("DEL", ::redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn increment_within(
        &self,
        key: &str,
        limit: u64,
        ttl: Option<Duration>,
    ) -> Result<Admission> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.map(|t| t.as_millis() as u64).unwrap_or(0);
        let (admitted, value): (i64, i64) = self
            .run(
                "INCREMENT_WITHIN",
                self.increment_within
                    .key(key)
                    .arg(limit)
                    .arg(ttl_ms)
                    .invoke_async(&mut conn),
            )
            .await?;

        Ok(if admitted == 1 {
            Admission::Admitted(to_count(value))
        } else {
            Admission::Refused(to_count(value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Requires a running server: `LLMGATE_TEST_REDIS_URL=redis://127.0.0.1/ cargo test -- --ignored`
    fn test_url() -> String {
        std::env::var("LLMGATE_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/".to_string())
    }

    fn unique_key(name: &str) -> String {
        format!("llmgate-test:{}:{}", name, uuid::Uuid::new_v4())
    }

    #[tokio::test]
    async fn test_invalid_url_is_config_error() {
        let err = RedisStore::connect("not a url", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(err.is_config());
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_increment_within() {
        let store = RedisStore::connect(&test_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = unique_key("bounded");

        assert_eq!(
            store.increment_within(&key, 2, None).await.unwrap(),
            Admission::Admitted(1)
        );
        assert_eq!(
            store.increment_within(&key, 2, None).await.unwrap(),
            Admission::Admitted(2)
        );
        assert_eq!(
            store.increment_within(&key, 2, None).await.unwrap(),
            Admission::Refused(2)
        );
        assert_eq!(store.get(&key).await.unwrap(), Some(2));

        store.reset(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_decrement_floor() {
        let store = RedisStore::connect(&test_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = unique_key("floor");

        assert!(matches!(
            store.decrement(&key).await,
            Err(GateError::CounterUnderflow(_))
        ));
        store.increment(&key).await.unwrap();
        assert_eq!(store.decrement(&key).await.unwrap(), 0);
        store.reset(&key).await.unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_zero_limit_leaves_no_key() {
        let store = RedisStore::connect(&test_url(), Duration::from_secs(2))
            .await
            .unwrap();
        let key = unique_key("zero");

        assert_eq!(
            store.increment_within(&key, 0, None).await.unwrap(),
            Admission::Refused(0)
        );
        assert_eq!(store.get(&key).await.unwrap(), None);
    }
}
