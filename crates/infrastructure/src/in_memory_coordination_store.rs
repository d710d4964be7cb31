use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use kestrel_application::{CoordinationStore, KeyTtl};
use kestrel_core::{AppError, AppResult};
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
enum StoredValue {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: StoredValue,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// Process-local coordination store for single-instance deployments and tests.
///
/// Mirrors the semantics of the Redis adapter; expired keys are purged lazily.
#[derive(Default)]
pub struct InMemoryCoordinationStore {
    entries: RwLock<HashMap<String, StoredEntry>>,
}

impl InMemoryCoordinationStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn deadline_after(ttl: Duration) -> AppResult<Instant> {
    if ttl.is_zero() {
        return Err(AppError::Validation(
            "coordination key ttl must be greater than zero".to_owned(),
        ));
    }

    let now = Instant::now();
    Ok(now.checked_add(ttl).unwrap_or(now))
}

fn live_entry<'a>(
    entries: &'a mut HashMap<String, StoredEntry>,
    key: &str,
) -> Option<&'a mut StoredEntry> {
    if entries
        .get(key)
        .is_some_and(|entry| entry.is_expired(Instant::now()))
    {
        entries.remove(key);
    }

    entries.get_mut(key)
}

fn holds_text(entry: &StoredEntry, expected: &str) -> bool {
    matches!(&entry.value, StoredValue::Text(value) if value == expected)
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        let expires_at = deadline_after(ttl)?;
        let mut entries = self.entries.write().await;
        if live_entry(&mut entries, key).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_owned(),
            StoredEntry {
                value: StoredValue::Text(value.to_owned()),
                expires_at: Some(expires_at),
            },
        );
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> AppResult<KeyTtl> {
        let entries = self.entries.read().await;
        let now = Instant::now();

        Ok(match entries.get(key) {
            Some(entry) if entry.is_expired(now) => KeyTtl::Missing,
            Some(StoredEntry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::ExpiresIn(deadline.saturating_duration_since(now)),
            Some(_) => KeyTtl::Persistent,
            None => KeyTtl::Missing,
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        let expires_at = deadline_after(ttl)?;
        let mut entries = self.entries.write().await;

        Ok(match live_entry(&mut entries, key) {
            Some(entry) => {
                entry.expires_at = Some(expires_at);
                true
            }
            None => false,
        })
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        let expires_at = deadline_after(ttl)?;
        let mut entries = self.entries.write().await;

        Ok(match live_entry(&mut entries, key) {
            Some(entry) if holds_text(entry, expected) => {
                entry.expires_at = Some(expires_at);
                true
            }
            _ => false,
        })
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> AppResult<bool> {
        let mut entries = self.entries.write().await;
        let matches = live_entry(&mut entries, key).is_some_and(|entry| holds_text(entry, expected));
        if matches {
            entries.remove(key);
        }

        Ok(matches)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let entries = self.entries.read().await;

        match entries.get(key) {
            Some(entry) if entry.is_expired(Instant::now()) => Ok(None),
            Some(StoredEntry {
                value: StoredValue::Text(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(AppError::Internal(format!(
                "coordination key '{key}' holds a hash, not a string"
            ))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.entries.write().await.insert(
            key.to_owned(),
            StoredEntry {
                value: StoredValue::Text(value.to_owned()),
                expires_at: None,
            },
        );

        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        let mut entries = self.entries.write().await;
        if live_entry(&mut entries, key).is_none() {
            entries.insert(
                key.to_owned(),
                StoredEntry {
                    value: StoredValue::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }

        match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(StoredValue::Hash(fields)) => {
                fields.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            _ => Err(AppError::Internal(format!(
                "coordination key '{key}' holds a string, not a hash"
            ))),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        let entries = self.entries.read().await;

        Ok(match entries.get(key) {
            Some(StoredEntry {
                value: StoredValue::Hash(fields),
                ..
            }) => fields.get(field).cloned(),
            _ => None,
        })
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let entries = self.entries.read().await;

        Ok(match entries.get(key) {
            Some(StoredEntry {
                value: StoredValue::Hash(fields),
                ..
            }) => fields.clone(),
            _ => HashMap::new(),
        })
    }

    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<bool> {
        let mut entries = self.entries.write().await;
        let Some(StoredValue::Hash(fields)) = entries.get_mut(key).map(|entry| &mut entry.value)
        else {
            return Ok(false);
        };

        let removed = fields.remove(field).is_some();
        if fields.is_empty() {
            entries.remove(key);
        }

        Ok(removed)
    }
}
