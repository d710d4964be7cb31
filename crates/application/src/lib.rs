//! Application services and ports.

#![forbid(unsafe_code)]

mod build_job_handler;
mod coordination_ports;
mod distributed_lock;
mod instance;
mod instance_directory;
mod master_backup;
mod request_controller;
mod request_handler;
mod request_lifecycle;
mod request_registry;
mod takeover;

#[cfg(test)]
mod test_support;

pub use build_job_handler::{BUILD_JOB_SCRATCH_KEY, BuildJobHandler, RENAME_SUFFIX_LENGTH};
pub use coordination_ports::{
    CoordinationStore, DEFAULT_KEY_NAMESPACE, KeyNamespace, KeyTtl, PodRepository,
    RequestArchive,
};
pub use distributed_lock::{DistributedLock, LOCK_POLL_INTERVAL, Lease, LeaseRenewal};
pub use instance::{Instance, InstanceSettings, InstanceState, TAKEOVER_ELECTION_JOB};
pub use instance_directory::InstanceDirectory;
pub use master_backup::{ElectionRole, ElectionSettings, MasterBackupJob, RoleTransitionHandler};
pub use request_controller::{
    AcceptedRequest, ControllerSettings, ExecutionPath, RequestController,
};
pub use request_handler::{
    ConcurrencySlot, HandlerRegistry, INSTANCE_NAME_FIELD, RequestHandler, ScratchValues,
    reassign_request, stamp_instance_name,
};
pub use request_lifecycle::RequestStatusRecorder;
pub use request_registry::RequestRegistry;
pub use takeover::{
    ScanOutcome, ScanSchedule, TakeoverDuty, TakeoverReport, TakeoverScanner, TakeoverSettings,
};
