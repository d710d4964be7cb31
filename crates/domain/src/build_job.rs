use kestrel_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handler prefix for build job requests.
pub const BUILD_JOB_PREFIX: &str = "buildjob";

/// Request type that creates one build pod.
pub const BUILD_JOB_CREATE_REQUEST_TYPE: &str = "buildjob_create";

/// Namespace used when a build job does not specify one.
pub const DEFAULT_BUILD_NAMESPACE: &str = "default";

/// Container configuration inside a build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Startup commands.
    #[serde(default, rename = "cmd")]
    pub commands: Vec<String>,
    /// Requested CPU quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_cpu: Option<String>,
    /// Requested memory quantity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_mem: Option<String>,
    /// CPU limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_cpu: Option<String>,
    /// Memory limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_mem: Option<String>,
}

/// Client payload describing one build pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildJobSpec {
    /// Pod name; also the request name.
    pub name: String,
    /// Target cluster.
    #[serde(default)]
    pub cluster_name: String,
    /// Network zone of the target cluster.
    #[serde(default)]
    pub network_zone: String,
    /// Whether the service may append a random suffix to keep names unique.
    #[serde(default)]
    pub re_name: bool,
    /// Pod labels.
    #[serde(default)]
    pub labels: Vec<String>,
    /// Target namespace.
    #[serde(default)]
    pub namespace: String,
    /// Whether resource tuning is accepted.
    #[serde(default)]
    pub tuning: bool,
    /// Containers of the pod.
    #[serde(default)]
    pub containers: Vec<ContainerSpec>,
    /// Owning instance, stamped by the accepting instance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_name: Option<String>,
}

impl BuildJobSpec {
    /// Parses a build job from a JSON payload.
    pub fn from_payload(payload: &Value) -> AppResult<Self> {
        serde_json::from_value(payload.clone())
            .map_err(|error| AppError::Validation(format!("invalid build job payload: {error}")))
    }

    /// Parses a build job from its serialized request payload.
    pub fn from_json(payload: &str) -> AppResult<Self> {
        serde_json::from_str(payload)
            .map_err(|error| AppError::Validation(format!("invalid build job payload: {error}")))
    }

    /// Serializes the build job to a JSON payload.
    pub fn to_payload(&self) -> AppResult<Value> {
        serde_json::to_value(self).map_err(|error| {
            AppError::Internal(format!("failed to serialize build job payload: {error}"))
        })
    }

    /// Validates required fields and fills defaults.
    pub fn normalize(&mut self) -> AppResult<()> {
        self.name = self.name.trim().to_owned();
        if self.name.is_empty() {
            return Err(AppError::Validation(
                "build job name must not be empty".to_owned(),
            ));
        }

        if self.name.contains('/') {
            return Err(AppError::Validation(format!(
                "build job name '{}' must not contain '/'",
                self.name
            )));
        }

        if self.namespace.trim().is_empty() {
            self.namespace = DEFAULT_BUILD_NAMESPACE.to_owned();
        }

        for (index, container) in self.containers.iter().enumerate() {
            if container.name.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "container #{index} of build job '{}' must have a name",
                    self.name
                )));
            }

            if container.image.trim().is_empty() {
                return Err(AppError::Validation(format!(
                    "container '{}' of build job '{}' must have an image",
                    container.name, self.name
                )));
            }
        }

        Ok(())
    }

    /// Appends a uniqueness suffix to the name.
    pub fn rename_with_suffix(&mut self, suffix: &str) {
        self.name = format!("{}-{suffix}", self.name);
    }
}

/// Status assigned to freshly created pods.
pub const POD_STATUS_PENDING: &str = "Pending";

/// Durable pod artifact produced by a successful build job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRecord {
    /// Pod name.
    pub name: String,
    /// Target cluster.
    pub cluster_name: String,
    /// Comma-joined labels.
    pub labels: String,
    /// Target namespace.
    pub namespace: String,
    /// Workload status.
    pub status: String,
    /// Scheduled node address; empty until scheduled.
    pub node_ip: String,
    /// Containers of the pod.
    pub containers: Vec<ContainerSpec>,
}

impl PodRecord {
    /// Builds the pending pod described by a build job.
    #[must_use]
    pub fn from_build_job(spec: &BuildJobSpec) -> Self {
        Self {
            name: spec.name.clone(),
            cluster_name: spec.cluster_name.clone(),
            labels: spec.labels.join(","),
            namespace: spec.namespace.clone(),
            status: POD_STATUS_PENDING.to_owned(),
            node_ip: String::new(),
            containers: spec.containers.clone(),
        }
    }
}
