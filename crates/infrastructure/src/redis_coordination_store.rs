//! Redis-backed coordination store shared by every instance of the fleet.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_application::{CoordinationStore, KeyTtl};
use kestrel_core::{AppError, AppResult};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

const EXPIRE_IF_VALUE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
else
  return 0
end
"#;

const DELETE_IF_VALUE_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
else
  return 0
end
"#;

/// Redis implementation of the coordination store port.
#[derive(Clone)]
pub struct RedisCoordinationStore {
    client: redis::Client,
}

impl RedisCoordinationStore {
    /// Creates one store adapter.
    #[must_use]
    pub fn new(client: redis::Client) -> Self {
        Self { client }
    }

    async fn connection(&self) -> AppResult<MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| AppError::Unavailable(format!("failed to connect to redis: {error}")))
    }
}

fn ttl_millis(ttl: Duration) -> AppResult<u64> {
    if ttl.is_zero() {
        return Err(AppError::Validation(
            "coordination key ttl must be greater than zero".to_owned(),
        ));
    }

    Ok(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1))
}

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to set coordination key '{key}': {error}"))
            })?;

        Ok(reply.is_some())
    }

    async fn ttl(&self, key: &str) -> AppResult<KeyTtl> {
        let mut connection = self.connection().await?;

        let remaining_ms: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to read ttl of '{key}': {error}"))
            })?;

        Ok(match remaining_ms {
            -2 => KeyTtl::Missing,
            -1 => KeyTtl::Persistent,
            remaining => KeyTtl::ExpiresIn(Duration::from_millis(
                u64::try_from(remaining).unwrap_or_default(),
            )),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let updated: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to set ttl of '{key}': {error}"))
            })?;

        Ok(updated == 1)
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let ttl_ms = ttl_millis(ttl)?;
        let mut connection = self.connection().await?;

        let renewed = Script::new(EXPIRE_IF_VALUE_SCRIPT)
            .key(key)
            .arg(expected)
            .arg(ttl_ms)
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| AppError::Internal(format!("failed to renew lease '{key}': {error}")))?;

        Ok(renewed == 1)
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;

        let deleted = Script::new(DELETE_IF_VALUE_SCRIPT)
            .key(key)
            .arg(expected)
            .invoke_async::<i64>(&mut connection)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to release lease '{key}': {error}"))
            })?;

        Ok(deleted == 1)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection().await?;

        connection
            .get::<_, Option<String>>(key)
            .await
            .map_err(|error| AppError::Internal(format!("failed to read '{key}': {error}")))
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        let mut connection = self.connection().await?;

        connection
            .set::<_, _, ()>(key, value)
            .await
            .map_err(|error| AppError::Internal(format!("failed to write '{key}': {error}")))
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let mut connection = self.connection().await?;

        connection
            .hset::<_, _, _, ()>(key, field, value)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to write field '{field}' of '{key}': {error}"))
            })
    }

    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        let mut connection = self.connection().await?;

        connection
            .hget::<_, _, Option<String>>(key, field)
            .await
            .map_err(|error| {
                AppError::Internal(format!("failed to read field '{field}' of '{key}': {error}"))
            })
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut connection = self.connection().await?;

        connection
            .hgetall::<_, HashMap<String, String>>(key)
            .await
            .map_err(|error| AppError::Internal(format!("failed to read hash '{key}': {error}")))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<bool> {
        let mut connection = self.connection().await?;

        let removed: i64 = connection.hdel(key, field).await.map_err(|error| {
            AppError::Internal(format!(
                "failed to delete field '{field}' of '{key}': {error}"
            ))
        })?;

        Ok(removed > 0)
    }
}
