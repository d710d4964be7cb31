use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::AppResult;

/// Remaining lifetime of one coordination key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist.
    Missing,
    /// Key exists without an expiry.
    Persistent,
    /// Key exists and expires after the given duration.
    ExpiresIn(Duration),
}

/// Shared key-value store used for leases, the instance list and request registries.
///
/// Every operation is atomic on a single key; callers never rely on multi-key
/// transactions.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Sets `key` to `value` with `ttl` only when the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool>;

    /// Returns the remaining lifetime of `key`.
    async fn ttl(&self, key: &str) -> AppResult<KeyTtl>;

    /// Sets a new expiry on an existing key and returns false when the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool>;

    /// Sets a new expiry only while `key` still holds `expected`.
    async fn expire_if_value(&self, key: &str, expected: &str, ttl: Duration)
    -> AppResult<bool>;

    /// Deletes `key` only while it still holds `expected`.
    async fn delete_if_value(&self, key: &str, expected: &str) -> AppResult<bool>;

    /// Reads a whole string value.
    async fn get(&self, key: &str) -> AppResult<Option<String>>;

    /// Writes a whole string value without expiry.
    async fn set(&self, key: &str, value: &str) -> AppResult<()>;

    /// Writes one hash field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()>;

    /// Reads one hash field.
    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>>;

    /// Reads every field of a hash; a missing hash reads as empty.
    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>>;

    /// Deletes one hash field and returns whether it existed.
    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<bool>;
}
