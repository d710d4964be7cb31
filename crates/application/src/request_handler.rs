//! Contract every request domain implements, plus the prefix registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{Request, RequestType};
use serde_json::Value;
use tokio::sync::OwnedSemaphorePermit;
use tracing::warn;

use crate::request_registry::RequestRegistry;

/// Payload field carrying the owning instance name.
pub const INSTANCE_NAME_FIELD: &str = "instanceName";

/// Per-request scratch space shared between the pipeline hooks.
pub type ScratchValues = HashMap<String, Value>;

/// One slot of the controller's worker pool.
///
/// The slot is released when dropped, so every exit path of an execution
/// frees its capacity.
#[derive(Debug)]
pub struct ConcurrencySlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencySlot {
    pub(crate) fn new(permit: OwnedSemaphorePermit) -> Self {
        Self { _permit: permit }
    }
}

/// Hooks driven by the request controller for one request domain.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Validates and normalizes the payload before anything is persisted.
    fn pre_exec(
        &self,
        payload: &mut Value,
        request_type: &RequestType,
        scratch: &mut ScratchValues,
    ) -> AppResult<()>;

    /// Stamps the owning instance into the payload.
    fn set_instance_name(&self, payload: &mut Value, instance_name: &InstanceName) {
        stamp_instance_name(payload, instance_name);
    }

    /// Builds the request and adds it to the registry.
    async fn make_request(
        &self,
        payload: &Value,
        request_type: &RequestType,
        scratch: &ScratchValues,
    ) -> AppResult<Request>;

    /// Executes the request; the slot must be held until the work is finished.
    async fn async_exec(&self, request: Request, slot: ConcurrencySlot) -> AppResult<()>;

    /// Follow-up run by the controller after the request was handed to the queue.
    ///
    /// Errors are logged and never reach the caller.
    async fn post_async_exec(
        &self,
        _request: &Request,
        _request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> AppResult<()> {
        Ok(())
    }

    /// Executes the request inline and returns its result.
    async fn sync_exec(
        &self,
        payload: Value,
        request_type: &RequestType,
        scratch: &ScratchValues,
    ) -> AppResult<Value>;

    /// Builds the response returned to the client when the request was queued.
    fn make_async_response(
        &self,
        payload: Value,
        request_type: &RequestType,
        scratch: &ScratchValues,
    ) -> Value;

    /// Makes `new_owner` the owner of a request left by a dead instance.
    async fn handle_take_over_request(
        &self,
        request: &mut Request,
        new_owner: &InstanceName,
    ) -> AppResult<()>;
}

/// Writes `instanceName` into an object payload.
pub fn stamp_instance_name(payload: &mut Value, instance_name: &InstanceName) {
    if let Some(object) = payload.as_object_mut() {
        object.insert(
            INSTANCE_NAME_FIELD.to_owned(),
            Value::String(instance_name.as_str().to_owned()),
        );
    }
}

/// Moves a request from its current owner's slot to `new_owner`'s slot.
///
/// The pending copy is written under the new owner before the old entry is
/// deleted, so a failure at any step leaves the request under at least one
/// owner. On error `request` is restored to its previous state.
pub async fn reassign_request(
    registry: &RequestRegistry,
    request: &mut Request,
    new_owner: &InstanceName,
) -> AppResult<()> {
    let previous = request.clone();
    request.reassign_to(new_owner.clone());
    if let Err(error) = registry.add_request(request).await {
        *request = previous;
        return Err(error);
    }

    if let Err(error) = registry.delete_request(&previous).await {
        if let Err(rollback_error) = registry.delete_request(request).await {
            warn!(
                request = %request.name(),
                owner = %new_owner,
                error = %rollback_error,
                "request left under both owners after failed reassignment"
            );
        }
        *request = previous;
        return Err(error);
    }

    Ok(())
}

/// Maps request-type prefixes to handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for every request type starting with `prefix`.
    pub fn register(
        &mut self,
        prefix: impl Into<String>,
        handler: Arc<dyn RequestHandler>,
    ) -> AppResult<()> {
        let prefix = prefix.into();
        let parsed = RequestType::parse(prefix.as_str())?;
        if parsed.verb().is_some() {
            return Err(AppError::Validation(format!(
                "handler prefix '{prefix}' must not contain '_'"
            )));
        }

        if self.handlers.contains_key(prefix.as_str()) {
            return Err(AppError::Conflict(format!(
                "a handler is already registered for prefix '{prefix}'"
            )));
        }

        self.handlers.insert(prefix, handler);
        Ok(())
    }

    /// Returns the handler responsible for `request_type`.
    pub fn resolve(&self, request_type: &RequestType) -> AppResult<Arc<dyn RequestHandler>> {
        self.handlers
            .get(request_type.prefix())
            .cloned()
            .ok_or_else(|| {
                AppError::Validation(format!("unsupported request type '{request_type}'"))
            })
    }

    /// Returns every registered prefix, sorted.
    #[must_use]
    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.handlers.keys().cloned().collect();
        prefixes.sort();
        prefixes
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kestrel_core::AppError;
    use kestrel_domain::{Request, RequestStatus};
    use serde_json::json;

    use crate::coordination_ports::KeyNamespace;
    use crate::request_registry::RequestRegistry;
    use crate::test_support::{FakeCoordinationStore, RecordingHandler, instance, request_type};

    use super::{HandlerRegistry, reassign_request, stamp_instance_name};

    #[test]
    fn resolve_routes_by_prefix() {
        let mut registry = HandlerRegistry::new();
        assert!(
            registry
                .register("buildjob", Arc::new(RecordingHandler::default()))
                .is_ok()
        );

        assert!(registry.resolve(&request_type("buildjob_create")).is_ok());
        assert!(registry.resolve(&request_type("buildjob_delete")).is_ok());
        assert!(matches!(
            registry.resolve(&request_type("deploy_create")),
            Err(AppError::Validation(message)) if message.contains("deploy_create")
        ));
    }

    #[test]
    fn duplicate_and_compound_prefixes_are_rejected() {
        let mut registry = HandlerRegistry::new();
        assert!(
            registry
                .register("buildjob", Arc::new(RecordingHandler::default()))
                .is_ok()
        );

        assert!(matches!(
            registry.register("buildjob", Arc::new(RecordingHandler::default())),
            Err(AppError::Conflict(_))
        ));
        assert!(matches!(
            registry.register("build_job", Arc::new(RecordingHandler::default())),
            Err(AppError::Validation(_))
        ));
        assert_eq!(registry.prefixes(), vec!["buildjob".to_owned()]);
    }

    #[test]
    fn stamp_overwrites_instance_name() {
        let mut payload = json!({"name": "job1", "instanceName": "stale"});
        stamp_instance_name(&mut payload, &instance("alpha001"));
        assert_eq!(payload["instanceName"], "alpha001");
    }

    #[tokio::test]
    async fn reassign_moves_request_between_owner_slots() {
        let store = Arc::new(FakeCoordinationStore::default());
        let registry = RequestRegistry::new(store.clone(), KeyNamespace::default());
        let mut request = Request::new(
            "job2",
            request_type("buildjob_create"),
            instance("bravo002"),
            "{}",
        )
        .unwrap_or_else(|_| unreachable!());
        assert!(request.transition_to(RequestStatus::Executing).is_ok());
        assert!(registry.add_request(&request).await.is_ok());

        let result = reassign_request(&registry, &mut request, &instance("alpha001")).await;

        assert!(result.is_ok());
        assert_eq!(store.hash_len("kestrel/buildjob/bravo002/requests").await, 0);
        let moved = registry
            .get_request("job2", &request_type("buildjob_create"), &instance("alpha001"))
            .await;
        assert!(matches!(
            moved,
            Ok(Some(ref moved)) if moved.status() == RequestStatus::Pending
        ));
    }

    async fn executing_request(
        store: &Arc<FakeCoordinationStore>,
        owner: &str,
    ) -> (RequestRegistry, Request) {
        let registry = RequestRegistry::new(store.clone(), KeyNamespace::default());
        let mut request = Request::new(
            "job2",
            request_type("buildjob_create"),
            instance(owner),
            "{}",
        )
        .unwrap_or_else(|_| unreachable!());
        assert!(request.transition_to(RequestStatus::Executing).is_ok());
        assert!(registry.add_request(&request).await.is_ok());
        (registry, request)
    }

    #[tokio::test]
    async fn failed_insert_keeps_request_under_old_owner() {
        let store = Arc::new(FakeCoordinationStore::default());
        let (registry, mut request) = executing_request(&store, "alpha001").await;
        store.set_fail_hash_sets(true);

        let result = reassign_request(&registry, &mut request, &instance("bravo002")).await;

        assert!(result.is_err());
        assert_eq!(request.instance_name().as_str(), "alpha001");
        assert_eq!(request.status(), RequestStatus::Executing);
        assert_eq!(store.hash_len("kestrel/buildjob/alpha001/requests").await, 1);
        assert_eq!(store.hash_len("kestrel/buildjob/bravo002/requests").await, 0);
    }

    #[tokio::test]
    async fn failed_delete_never_drops_the_old_entry() {
        let store = Arc::new(FakeCoordinationStore::default());
        let (registry, mut request) = executing_request(&store, "alpha001").await;
        store.set_fail_hash_deletes(true);

        let result = reassign_request(&registry, &mut request, &instance("bravo002")).await;

        assert!(result.is_err());
        assert_eq!(request.instance_name().as_str(), "alpha001");
        let kept = registry
            .get_request("job2", &request_type("buildjob_create"), &instance("alpha001"))
            .await;
        assert!(matches!(
            kept,
            Ok(Some(ref kept)) if kept.status() == RequestStatus::Executing
        ));
    }
}
