use std::sync::Arc;

use kestrel_core::AppResult;
use kestrel_domain::{Request, RequestStatus};
use tracing::{info, warn};

use crate::coordination_ports::RequestArchive;
use crate::request_registry::RequestRegistry;

/// Applies status transitions to the registry and the failure archive.
///
/// Terminal requests leave the registry: successes are dropped, failures
/// are archived first so they are never lost.
#[derive(Clone)]
pub struct RequestStatusRecorder {
    registry: RequestRegistry,
    archive: Arc<dyn RequestArchive>,
}

impl RequestStatusRecorder {
    /// Creates a recorder.
    #[must_use]
    pub fn new(registry: RequestRegistry, archive: Arc<dyn RequestArchive>) -> Self {
        Self { registry, archive }
    }

    /// Returns the registry this recorder writes to.
    #[must_use]
    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    /// Marks the request as picked up by a worker.
    pub async fn mark_executing(&self, request: &mut Request) -> AppResult<()> {
        if request.transition_to(RequestStatus::Executing)? {
            self.registry.update_request(request).await?;
        }

        Ok(())
    }

    /// Marks the request successful and removes it from the registry.
    pub async fn mark_succeeded(&self, request: &mut Request) -> AppResult<()> {
        request.transition_to(RequestStatus::Success)?;
        self.registry.delete_request(request).await?;

        info!(
            request_name = %request.name(),
            request_type = %request.request_type(),
            "request succeeded"
        );
        Ok(())
    }

    /// Marks the request failed, archives it and removes it from the registry.
    pub async fn mark_failed(&self, request: &mut Request, message: &str) -> AppResult<()> {
        request.fail_with(message)?;
        self.archive.append_failed_request(request).await?;
        self.registry.delete_request(request).await?;

        warn!(
            request_name = %request.name(),
            request_type = %request.request_type(),
            reason = %message,
            "request failed"
        );
        Ok(())
    }
}
