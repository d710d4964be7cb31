use async_trait::async_trait;
use kestrel_core::AppResult;
use kestrel_domain::{PodRecord, Request};

/// Append-only archive of requests that ended in failure.
#[async_trait]
pub trait RequestArchive: Send + Sync {
    /// Persists one failed request.
    async fn append_failed_request(&self, request: &Request) -> AppResult<()>;
}

/// Durable storage for pods produced by build jobs.
#[async_trait]
pub trait PodRepository: Send + Sync {
    /// Persists one pod and its containers.
    async fn insert_pod(&self, pod: &PodRecord) -> AppResult<()>;
}
