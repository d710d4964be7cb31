//! Domain entities and invariants.

#![forbid(unsafe_code)]

mod build_job;
mod request;

pub use build_job::{
    BUILD_JOB_CREATE_REQUEST_TYPE, BUILD_JOB_PREFIX, BuildJobSpec, ContainerSpec,
    DEFAULT_BUILD_NAMESPACE, POD_STATUS_PENDING, PodRecord,
};
pub use request::{REQUEST_TYPE_SEPARATOR, Request, RequestStatus, RequestType, registry_field};
