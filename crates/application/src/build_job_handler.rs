//! Handler for `buildjob_*` requests: turns a build job into a pending pod.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::random::random_lower_alphanumeric;
use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{
    BUILD_JOB_CREATE_REQUEST_TYPE, BuildJobSpec, PodRecord, Request, RequestType,
};
use serde_json::Value;
use tracing::{info, warn};

use crate::coordination_ports::PodRepository;
use crate::request_handler::{
    ConcurrencySlot, INSTANCE_NAME_FIELD, RequestHandler, ScratchValues, reassign_request,
};
use crate::request_lifecycle::RequestStatusRecorder;
use crate::request_registry::RequestRegistry;


/// Scratch key holding the normalized build job.
pub const BUILD_JOB_SCRATCH_KEY: &str = "build_job";

/// Length of the random suffix appended when `reName` is set.
pub const RENAME_SUFFIX_LENGTH: usize = 5;

/// Creates pod records for build jobs.
pub struct BuildJobHandler {
    registry: RequestRegistry,
    recorder: RequestStatusRecorder,
    pods: Arc<dyn PodRepository>,
    processing_delay: Duration,
}

impl BuildJobHandler {
    /// Creates a handler; `processing_delay` is waited before each execution.
    #[must_use]
    pub fn new(
        recorder: RequestStatusRecorder,
        pods: Arc<dyn PodRepository>,
        processing_delay: Duration,
    ) -> Self {
        Self {
            registry: recorder.registry().clone(),
            recorder,
            pods,
            processing_delay,
        }
    }

    async fn execute(&self, request: &mut Request) -> AppResult<()> {
        self.recorder.mark_executing(request).await?;

        let spec = BuildJobSpec::from_json(request.payload())?;
        self.pods
            .insert_pod(&PodRecord::from_build_job(&spec))
            .await?;

        self.recorder.mark_succeeded(request).await
    }
}

fn spec_from_scratch(scratch: &ScratchValues, payload: &Value) -> AppResult<BuildJobSpec> {
    match scratch.get(BUILD_JOB_SCRATCH_KEY) {
        Some(value) => BuildJobSpec::from_payload(value),
        None => BuildJobSpec::from_payload(payload),
    }
}

#[async_trait]
impl RequestHandler for BuildJobHandler {
    fn pre_exec(
        &self,
        payload: &mut Value,
        request_type: &RequestType,
        scratch: &mut ScratchValues,
    ) -> AppResult<()> {
        if request_type.as_str() != BUILD_JOB_CREATE_REQUEST_TYPE {
            return Err(AppError::Validation(format!(
                "invalid request type '{request_type}' for build jobs"
            )));
        }

        let mut spec = BuildJobSpec::from_payload(payload)?;
        spec.normalize()?;
        if spec.re_name {
            spec.rename_with_suffix(random_lower_alphanumeric(RENAME_SUFFIX_LENGTH).as_str());
        }

        let normalized = spec.to_payload()?;
        scratch.insert(BUILD_JOB_SCRATCH_KEY.to_owned(), normalized.clone());
        *payload = normalized;
        Ok(())
    }

    async fn make_request(
        &self,
        payload: &Value,
        request_type: &RequestType,
        scratch: &ScratchValues,
    ) -> AppResult<Request> {
        let spec = spec_from_scratch(scratch, payload)?;
        let owner = spec.instance_name.as_deref().ok_or_else(|| {
            AppError::Validation(format!(
                "build job '{}' has no owning instance",
                spec.name
            ))
        })?;

        let request = Request::new(
            spec.name.as_str(),
            request_type.clone(),
            InstanceName::new(owner)?,
            payload.to_string(),
        )?;
        self.registry.add_request(&request).await?;
        Ok(request)
    }

    async fn async_exec(&self, mut request: Request, slot: ConcurrencySlot) -> AppResult<()> {
        let _slot = slot;
        if !self.processing_delay.is_zero() {
            tokio::time::sleep(self.processing_delay).await;
        }

        let Err(error) = self.execute(&mut request).await else {
            return Ok(());
        };

        if let Err(record_error) = self
            .recorder
            .mark_failed(&mut request, error.to_string().as_str())
            .await
        {
            warn!(
                request = %request.name(),
                error = %record_error,
                "failed to record build job failure"
            );
        }

        Err(error)
    }

    async fn sync_exec(
        &self,
        payload: Value,
        _request_type: &RequestType,
        scratch: &ScratchValues,
    ) -> AppResult<Value> {
        let spec = spec_from_scratch(scratch, &payload)?;
        self.pods
            .insert_pod(&PodRecord::from_build_job(&spec))
            .await?;

        info!(build_job = %spec.name, "build job executed synchronously");
        Ok(payload)
    }

    fn make_async_response(
        &self,
        mut payload: Value,
        _request_type: &RequestType,
        _scratch: &ScratchValues,
    ) -> Value {
        if let Some(object) = payload.as_object_mut() {
            object.remove(INSTANCE_NAME_FIELD);
        }

        payload
    }

    async fn handle_take_over_request(
        &self,
        request: &mut Request,
        new_owner: &InstanceName,
    ) -> AppResult<()> {
        reassign_request(&self.registry, request, new_owner).await
    }
}
