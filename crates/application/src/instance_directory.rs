use std::sync::Arc;

use kestrel_core::{AppError, AppResult, InstanceName};

use crate::coordination_ports::{CoordinationStore, KeyNamespace};

/// Shared list of every instance name known to the fleet.
///
/// Mutations must happen while holding the cluster meta lock.
#[derive(Clone)]
pub struct InstanceDirectory {
    store: Arc<dyn CoordinationStore>,
    keys: KeyNamespace,
}

impl InstanceDirectory {
    /// Creates a directory over the shared store.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>, keys: KeyNamespace) -> Self {
        Self { store, keys }
    }

    /// Reads the list; a missing key reads as empty.
    pub async fn list(&self) -> AppResult<Vec<InstanceName>> {
        let key = self.keys.instance_list_key();
        let Some(raw) = self.store.get(key.as_str()).await? else {
            return Ok(Vec::new());
        };

        let names: Vec<String> = serde_json::from_str(raw.as_str()).map_err(|error| {
            AppError::Internal(format!("instance list at '{key}' is not valid json: {error}"))
        })?;

        names.into_iter().map(InstanceName::new).collect()
    }

    /// Overwrites the list.
    pub async fn replace(&self, names: &[InstanceName]) -> AppResult<()> {
        let encoded = serde_json::to_string(names).map_err(|error| {
            AppError::Internal(format!("failed to encode instance list: {error}"))
        })?;

        self.store
            .set(self.keys.instance_list_key().as_str(), encoded.as_str())
            .await
    }

    /// Appends `name` when missing. Returns whether the list changed.
    pub async fn append(&self, name: &InstanceName) -> AppResult<bool> {
        let mut names = self.list().await?;
        if names.contains(name) {
            return Ok(false);
        }

        names.push(name.clone());
        self.replace(&names).await?;
        Ok(true)
    }
}
