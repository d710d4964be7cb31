//! Per-instance registry of in-flight requests.
//!
//! Requests live in one hash per (request domain, owning instance), keyed by
//! `<requestType>/<name>`. Terminal requests are removed, so the registry only
//! ever holds work that still needs an owner.

use std::sync::Arc;

use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{Request, RequestType, registry_field};
use tracing::debug;

use crate::coordination_ports::{CoordinationStore, KeyNamespace};
use crate::instance_directory::InstanceDirectory;

/// Reads and writes request records in shared state.
#[derive(Clone)]
pub struct RequestRegistry {
    store: Arc<dyn CoordinationStore>,
    keys: KeyNamespace,
    directory: InstanceDirectory,
}

impl RequestRegistry {
    /// Creates a registry over the shared store.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeyNamespace) -> Self {
        let directory = InstanceDirectory::new(store.clone(), keys.clone());
        Self {
            store,
            keys,
            directory,
        }
    }

    fn hash_key(&self, request_type: &RequestType, owner: &InstanceName) -> String {
        self.keys.request_hash_key(request_type.prefix(), owner)
    }

    /// Stores a request under its owner's slot.
    pub async fn add_request(&self, request: &Request) -> AppResult<()> {
        let encoded = encode(request)?;
        self.store
            .hash_set(
                self.hash_key(request.request_type(), request.instance_name())
                    .as_str(),
                request.registry_field().as_str(),
                encoded.as_str(),
            )
            .await?;

        debug!(
            request_name = %request.name(),
            request_type = %request.request_type(),
            instance_name = %request.instance_name(),
            "request registered"
        );
        Ok(())
    }

    /// Overwrites a stored request with its current state.
    pub async fn update_request(&self, request: &Request) -> AppResult<()> {
        self.add_request(request).await
    }

    /// Removes a request from its owner's slot.
    pub async fn delete_request(&self, request: &Request) -> AppResult<bool> {
        self.store
            .hash_delete(
                self.hash_key(request.request_type(), request.instance_name())
                    .as_str(),
                request.registry_field().as_str(),
            )
            .await
    }

    /// Reads one request from a known owner.
    pub async fn get_request(
        &self,
        name: &str,
        request_type: &RequestType,
        owner: &InstanceName,
    ) -> AppResult<Option<Request>> {
        let raw = self
            .store
            .hash_get(
                self.hash_key(request_type, owner).as_str(),
                registry_field(request_type, name).as_str(),
            )
            .await?;

        raw.map(|raw| decode(raw.as_str())).transpose()
    }

    /// Looks a request up across every instance in the directory.
    pub async fn find_request(
        &self,
        name: &str,
        request_type: &RequestType,
    ) -> AppResult<Option<Request>> {
        for owner in self.directory.list().await? {
            if let Some(request) = self.get_request(name, request_type, &owner).await? {
                return Ok(Some(request));
            }
        }

        Ok(None)
    }

    /// Lists every request owned by `owner` in the given request domains.
    pub async fn list_requests_for_instance(
        &self,
        owner: &InstanceName,
        domains: &[String],
    ) -> AppResult<Vec<Request>> {
        let mut requests = Vec::new();
        for domain in domains {
            let key = self.keys.request_hash_key(domain.as_str(), owner);
            let mut entries: Vec<(String, String)> =
                self.store.hash_get_all(key.as_str()).await?.into_iter().collect();
            entries.sort_by(|left, right| left.0.cmp(&right.0));

            for (_, raw) in entries {
                requests.push(decode(raw.as_str())?);
            }
        }

        Ok(requests)
    }
}

fn encode(request: &Request) -> AppResult<String> {
    serde_json::to_string(request).map_err(|error| {
        AppError::Internal(format!(
            "failed to encode request '{}': {error}",
            request.name()
        ))
    })
}

fn decode(raw: &str) -> AppResult<Request> {
    serde_json::from_str(raw)
        .map_err(|error| AppError::Internal(format!("stored request is not valid json: {error}")))
}
