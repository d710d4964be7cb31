use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{PodRecord, Request, RequestType};

use crate::coordination_ports::{CoordinationStore, KeyTtl, PodRepository, RequestArchive};
use crate::request_handler::{ConcurrencySlot, RequestHandler, ScratchValues, reassign_request};
use crate::request_registry::RequestRegistry;

enum FakeValue {
    Text(String),
    Hash(HashMap<String, String>),
}

struct FakeEntry {
    value: FakeValue,
    expires_at: Option<Instant>,
}

impl FakeEntry {
    fn is_live(&self) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > Instant::now())
    }
}

/// Coordination store double with real expiry semantics and failure switches.
#[derive(Default)]
pub(crate) struct FakeCoordinationStore {
    entries: Mutex<HashMap<String, FakeEntry>>,
    unavailable: AtomicBool,
    fail_hash_writes: AtomicBool,
    fail_hash_sets: AtomicBool,
    fail_hash_deletes: AtomicBool,
}

impl FakeCoordinationStore {
    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_hash_writes(&self, fail: bool) {
        self.fail_hash_writes.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_hash_sets(&self, fail: bool) {
        self.fail_hash_sets.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_fail_hash_deletes(&self, fail: bool) {
        self.fail_hash_deletes.store(fail, Ordering::SeqCst);
    }

    /// Drops a key as if its TTL had elapsed.
    pub(crate) async fn expire_key(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Writes a value without expiry, bypassing lock semantics.
    pub(crate) async fn put_persistent(&self, key: &str, value: &str) {
        self.entries.lock().await.insert(
            key.to_owned(),
            FakeEntry {
                value: FakeValue::Text(value.to_owned()),
                expires_at: None,
            },
        );
    }

    pub(crate) async fn text(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live() => match &entry.value {
                FakeValue::Text(value) => Some(value.clone()),
                FakeValue::Hash(_) => None,
            },
            _ => None,
        }
    }

    pub(crate) async fn hash_len(&self, key: &str) -> usize {
        let entries = self.entries.lock().await;
        match entries.get(key).map(|entry| &entry.value) {
            Some(FakeValue::Hash(fields)) => fields.len(),
            _ => 0,
        }
    }

    fn check_available(&self) -> AppResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable(
                "coordination store is unreachable".to_owned(),
            ));
        }

        Ok(())
    }

    fn purge_expired(entries: &mut HashMap<String, FakeEntry>, key: &str) {
        if entries.get(key).is_some_and(|entry| !entry.is_live()) {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl CoordinationStore for FakeCoordinationStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key);
        if entries.contains_key(key) {
            return Ok(false);
        }

        entries.insert(
            key.to_owned(),
            FakeEntry {
                value: FakeValue::Text(value.to_owned()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn ttl(&self, key: &str) -> AppResult<KeyTtl> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key);
        Ok(match entries.get(key) {
            None => KeyTtl::Missing,
            Some(FakeEntry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(FakeEntry {
                expires_at: Some(deadline),
                ..
            }) => KeyTtl::ExpiresIn(deadline.saturating_duration_since(Instant::now())),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn expire_if_value(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) if matches!(&entry.value, FakeValue::Text(value) if value == expected) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_if_value(&self, key: &str, expected: &str) -> AppResult<bool> {
        self.check_available()?;
        let mut entries = self.entries.lock().await;
        Self::purge_expired(&mut entries, key);
        let matches = entries
            .get(key)
            .is_some_and(|entry| matches!(&entry.value, FakeValue::Text(value) if value == expected));
        if matches {
            entries.remove(key);
        }

        Ok(matches)
    }

    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        self.check_available()?;
        Ok(self.text(key).await)
    }

    async fn set(&self, key: &str, value: &str) -> AppResult<()> {
        self.check_available()?;
        self.put_persistent(key, value).await;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> AppResult<()> {
        self.check_available()?;
        if self.fail_hash_writes.load(Ordering::SeqCst)
            || self.fail_hash_sets.load(Ordering::SeqCst)
        {
            return Err(AppError::Unavailable("hash write rejected".to_owned()));
        }

        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_owned()).or_insert_with(|| FakeEntry {
            value: FakeValue::Hash(HashMap::new()),
            expires_at: None,
        });
        match &mut entry.value {
            FakeValue::Hash(fields) => {
                fields.insert(field.to_owned(), value.to_owned());
                Ok(())
            }
            FakeValue::Text(_) => Err(AppError::Internal(format!(
                "key '{key}' does not hold a hash"
            ))),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> AppResult<Option<String>> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(match entries.get(key).map(|entry| &entry.value) {
            Some(FakeValue::Hash(fields)) => fields.get(field).cloned(),
            _ => None,
        })
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        self.check_available()?;
        let entries = self.entries.lock().await;
        Ok(match entries.get(key).map(|entry| &entry.value) {
            Some(FakeValue::Hash(fields)) => fields.clone(),
            _ => HashMap::new(),
        })
    }

    async fn hash_delete(&self, key: &str, field: &str) -> AppResult<bool> {
        self.check_available()?;
        if self.fail_hash_writes.load(Ordering::SeqCst)
            || self.fail_hash_deletes.load(Ordering::SeqCst)
        {
            return Err(AppError::Unavailable("hash write rejected".to_owned()));
        }

        let mut entries = self.entries.lock().await;
        let removed = match entries.get_mut(key).map(|entry| &mut entry.value) {
            Some(FakeValue::Hash(fields)) => fields.remove(field).is_some(),
            _ => false,
        };
        if matches!(entries.get(key).map(|entry| &entry.value), Some(FakeValue::Hash(fields)) if fields.is_empty())
        {
            entries.remove(key);
        }

        Ok(removed)
    }
}

#[derive(Default)]
pub(crate) struct FakeRequestArchive {
    pub(crate) failed: Mutex<Vec<Request>>,
}

#[async_trait]
impl RequestArchive for FakeRequestArchive {
    async fn append_failed_request(&self, request: &Request) -> AppResult<()> {
        self.failed.lock().await.push(request.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakePodRepository {
    pub(crate) pods: Mutex<Vec<PodRecord>>,
    fail_inserts: AtomicBool,
    gate: Option<Arc<Notify>>,
}

impl FakePodRepository {
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn set_fail_inserts(&self, fail: bool) {
        self.fail_inserts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PodRepository for FakePodRepository {
    async fn insert_pod(&self, pod: &PodRecord) -> AppResult<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        if self.fail_inserts.load(Ordering::SeqCst) {
            return Err(AppError::Internal(format!(
                "pod '{}' could not be inserted",
                pod.name
            )));
        }

        self.pods.lock().await.push(pod.clone());
        Ok(())
    }
}

/// Handler that records every call and optionally blocks workers on a gate.
#[derive(Default)]
pub(crate) struct RecordingHandler {
    pub(crate) executed: Mutex<Vec<Request>>,
    pub(crate) synchronous: Mutex<Vec<Value>>,
    pub(crate) taken_over: Mutex<Vec<Request>>,
    pub(crate) reject_pre_exec: AtomicBool,
    pub(crate) fail_make_request: AtomicBool,
    pub(crate) fail_post_exec: AtomicBool,
    gate: Option<Arc<Notify>>,
    registry: Option<RequestRegistry>,
    concurrent_writes: Option<(Arc<FakeCoordinationStore>, Vec<(String, String)>)>,
}

impl RecordingHandler {
    pub(crate) fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    /// Handler whose takeover moves requests between registry slots.
    pub(crate) fn reassigning(registry: RequestRegistry) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Reassigning handler that also writes `writes` to `store` mid-takeover,
    /// standing in for another instance acting while the scan runs.
    pub(crate) fn reassigning_with_concurrent_writes(
        registry: RequestRegistry,
        store: Arc<FakeCoordinationStore>,
        writes: Vec<(String, String)>,
    ) -> Self {
        Self {
            registry: Some(registry),
            concurrent_writes: Some((store, writes)),
            ..Self::default()
        }
    }
}

#[async_trait]
impl RequestHandler for RecordingHandler {
    fn pre_exec(
        &self,
        payload: &mut Value,
        _request_type: &RequestType,
        _scratch: &mut ScratchValues,
    ) -> AppResult<()> {
        if self.reject_pre_exec.load(Ordering::SeqCst) {
            return Err(AppError::Validation("payload rejected".to_owned()));
        }

        if payload.get("name").and_then(Value::as_str).is_none() {
            return Err(AppError::Validation("payload needs a name".to_owned()));
        }

        Ok(())
    }

    async fn make_request(
        &self,
        payload: &Value,
        request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> AppResult<Request> {
        if self.fail_make_request.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable("registry write rejected".to_owned()));
        }

        let name = payload
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let owner = payload
            .get("instanceName")
            .and_then(Value::as_str)
            .unwrap_or_default();
        Request::new(
            name,
            request_type.clone(),
            InstanceName::new(owner)?,
            payload.to_string(),
        )
    }

    async fn async_exec(&self, request: Request, slot: ConcurrencySlot) -> AppResult<()> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        self.executed.lock().await.push(request);
        drop(slot);
        Ok(())
    }

    async fn post_async_exec(
        &self,
        _request: &Request,
        _request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> AppResult<()> {
        if self.fail_post_exec.load(Ordering::SeqCst) {
            return Err(AppError::Internal("post hook failed".to_owned()));
        }

        Ok(())
    }

    async fn sync_exec(
        &self,
        payload: Value,
        _request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> AppResult<Value> {
        self.synchronous.lock().await.push(payload.clone());
        Ok(payload)
    }

    fn make_async_response(
        &self,
        payload: Value,
        _request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> Value {
        payload
    }

    async fn handle_take_over_request(
        &self,
        request: &mut Request,
        new_owner: &InstanceName,
    ) -> AppResult<()> {
        if let Some((store, writes)) = &self.concurrent_writes {
            for (key, value) in writes {
                store.put_persistent(key, value).await;
            }
        }

        match &self.registry {
            Some(registry) => reassign_request(registry, request, new_owner).await?,
            None => request.reassign_to(new_owner.clone()),
        }
        self.taken_over.lock().await.push(request.clone());
        Ok(())
    }
}

pub(crate) fn instance(name: &str) -> InstanceName {
    InstanceName::new(name).unwrap_or_else(|_| unreachable!())
}

pub(crate) fn request_type(value: &str) -> RequestType {
    RequestType::parse(value).unwrap_or_else(|_| unreachable!())
}
