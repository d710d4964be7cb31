use async_trait::async_trait;
use kestrel_application::{PodRepository, RequestArchive};
use kestrel_core::AppResult;
use kestrel_domain::{PodRecord, Request};
use tokio::sync::RwLock;

/// Process-local failed-request archive used when no database is configured.
#[derive(Default)]
pub struct InMemoryRequestArchive {
    failed: RwLock<Vec<Request>>,
}

impl InMemoryRequestArchive {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every archived request in insertion order.
    pub async fn failed_requests(&self) -> Vec<Request> {
        self.failed.read().await.clone()
    }
}

#[async_trait]
impl RequestArchive for InMemoryRequestArchive {
    async fn append_failed_request(&self, request: &Request) -> AppResult<()> {
        self.failed.write().await.push(request.clone());
        Ok(())
    }
}

/// Process-local pod store used when no database is configured.
#[derive(Default)]
pub struct InMemoryPodRepository {
    pods: RwLock<Vec<PodRecord>>,
}

impl InMemoryPodRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every stored pod in insertion order.
    pub async fn pods(&self) -> Vec<PodRecord> {
        self.pods.read().await.clone()
    }
}

#[async_trait]
impl PodRepository for InMemoryPodRepository {
    async fn insert_pod(&self, pod: &PodRecord) -> AppResult<()> {
        self.pods.write().await.push(pod.clone());
        Ok(())
    }
}
