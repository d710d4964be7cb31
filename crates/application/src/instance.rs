//! Lifecycle of one worker instance: lease, registration, heartbeat and duties.

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{AppError, AppResult, InstanceName};
use kestrel_domain::{Request, RequestType};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordination_ports::{CoordinationStore, KeyNamespace};
use crate::distributed_lock::{DistributedLock, Lease, LeaseRenewal};
use crate::instance_directory::InstanceDirectory;
use crate::master_backup::{ElectionRole, ElectionSettings, MasterBackupJob};
use crate::request_controller::{AcceptedRequest, ControllerSettings, RequestController};
use crate::request_handler::HandlerRegistry;
use crate::request_registry::RequestRegistry;
use crate::takeover::{ScanSchedule, TakeoverDuty, TakeoverScanner, TakeoverSettings};


/// Name of the election that decides which instance scans for dead peers.
pub const TAKEOVER_ELECTION_JOB: &str = "takeover-master";

/// Tunables of one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSettings {
    /// Liveness lease duration.
    pub lease_ttl: Duration,
    /// Heartbeat period; must be shorter than the lease.
    pub renew_interval: Duration,
    /// Lease duration of the cluster lock taken for registration.
    pub registration_lock_ttl: Duration,
    /// Upper bound on waiting for the cluster lock at startup.
    pub registration_timeout: Duration,
    /// Delay between dead-instance scans while master.
    pub scan_schedule: ScanSchedule,
    /// Period of the self-liveness log line.
    pub liveness_log_interval: Duration,
    /// Timing of the takeover election.
    pub election: ElectionSettings,
    /// Cluster-lock gate of each scan.
    pub takeover: TakeoverSettings,
}

impl Default for InstanceSettings {
    fn default() -> Self {
        Self {
            lease_ttl: Duration::from_secs(6),
            renew_interval: Duration::from_secs(3),
            registration_lock_ttl: Duration::from_secs(60),
            registration_timeout: Duration::from_secs(10),
            scan_schedule: ScanSchedule {
                base_interval: Duration::from_secs(30),
                jitter: Duration::from_secs(20),
            },
            liveness_log_interval: Duration::from_secs(60),
            election: ElectionSettings::default(),
            takeover: TakeoverSettings::default(),
        }
    }
}

/// Local lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Created, not yet registered.
    Starting,
    /// Registered and accepting requests.
    Live,
    /// Draining; new requests are rejected.
    ShuttingDown,
    /// Lease released.
    Stopped,
}

impl InstanceState {
    /// Returns stable display value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Live => "live",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

struct InstanceRuntime {
    lease: Lease,
    duties: CancellationToken,
    heartbeat: CancellationToken,
    election_role: watch::Receiver<ElectionRole>,
    dispatch_task: JoinHandle<()>,
    heartbeat_task: JoinHandle<()>,
    election_task: JoinHandle<()>,
    liveness_task: JoinHandle<()>,
}

/// One worker process taking part in the fleet.
pub struct Instance {
    name: InstanceName,
    keys: KeyNamespace,
    lock: DistributedLock,
    directory: InstanceDirectory,
    registry: RequestRegistry,
    controller: Arc<RequestController>,
    settings: InstanceSettings,
    state: watch::Sender<InstanceState>,
    runtime: Mutex<Option<InstanceRuntime>>,
}

impl Instance {
    /// Creates an instance; nothing touches shared state until [`Self::start`].
    pub fn new(
        name: InstanceName,
        store: Arc<dyn CoordinationStore>,
        keys: KeyNamespace,
        handlers: HandlerRegistry,
        controller_settings: ControllerSettings,
        settings: InstanceSettings,
    ) -> AppResult<Self> {
        if settings.renew_interval.is_zero() || settings.renew_interval >= settings.lease_ttl {
            return Err(AppError::Validation(
                "instance renew interval must be positive and shorter than the lease ttl"
                    .to_owned(),
            ));
        }

        if settings.liveness_log_interval.is_zero() {
            return Err(AppError::Validation(
                "instance liveness log interval must be greater than zero".to_owned(),
            ));
        }

        let controller = Arc::new(RequestController::new(
            name.clone(),
            handlers,
            controller_settings,
        )?);
        let (state, _) = watch::channel(InstanceState::Starting);

        Ok(Self {
            name,
            lock: DistributedLock::new(store.clone()),
            directory: InstanceDirectory::new(store.clone(), keys.clone()),
            registry: RequestRegistry::new(store, keys.clone()),
            keys,
            controller,
            settings,
            state,
            runtime: Mutex::new(None),
        })
    }

    /// Returns the instance name.
    #[must_use]
    pub fn name(&self) -> &InstanceName {
        &self.name
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> InstanceState {
        *self.state.borrow()
    }

    /// Subscribes to lifecycle changes.
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<InstanceState> {
        self.state.subscribe()
    }

    /// Returns the request controller of this instance.
    #[must_use]
    pub fn controller(&self) -> &Arc<RequestController> {
        &self.controller
    }

    /// Returns the takeover election role, or `None` before start.
    pub async fn election_role(&self) -> Option<ElectionRole> {
        self.runtime
            .lock()
            .await
            .as_ref()
            .map(|runtime| *runtime.election_role.borrow())
    }

    /// Returns whether the liveness lease is present in shared state.
    pub async fn is_live(&self) -> AppResult<bool> {
        let lease_key = self.keys.instance_lease_key(&self.name);
        Ok(!self.lock.is_expired(lease_key.as_str()).await?)
    }

    /// Accepts one request while the instance is live.
    pub async fn accept_request(
        &self,
        payload: Value,
        request_type: &str,
    ) -> AppResult<AcceptedRequest> {
        let state = self.state();
        if state != InstanceState::Live {
            return Err(AppError::Conflict(format!(
                "instance '{}' is {} and accepts no requests",
                self.name,
                state.as_str()
            )));
        }

        self.controller.accept_request(payload, request_type).await
    }

    /// Looks up an in-flight request on any listed instance.
    pub async fn find_request(&self, name: &str, request_type: &str) -> AppResult<Option<Request>> {
        let request_type = RequestType::parse(request_type)?;
        self.registry.find_request(name, &request_type).await
    }

    /// Takes the liveness lease, registers in the instance list and starts
    /// the dispatch loop, heartbeat and takeover election.
    pub async fn start(&self) -> AppResult<()> {
        let mut runtime = self.runtime.lock().await;
        if runtime.is_some() || self.state() != InstanceState::Starting {
            return Err(AppError::Conflict(format!(
                "instance '{}' was already started",
                self.name
            )));
        }

        let scanner = TakeoverScanner::new(
            self.lock.clone(),
            self.directory.clone(),
            self.registry.clone(),
            self.keys.clone(),
            self.controller.clone(),
            self.settings.takeover.clone(),
        );
        let election = MasterBackupJob::new(
            self.keys.election_key(TAKEOVER_ELECTION_JOB),
            self.lock.clone(),
            Arc::new(TakeoverDuty::new(scanner, self.settings.scan_schedule)),
            self.settings.election.clone(),
        )?;

        let lease_key = self.keys.instance_lease_key(&self.name);
        let lease = self
            .lock
            .lock_key(lease_key.as_str(), self.settings.lease_ttl)
            .await?
            .ok_or_else(|| {
                AppError::Conflict(format!(
                    "liveness lease for instance '{}' is already held",
                    self.name
                ))
            })?;

        let registration = self.registration();
        if let Err(error) = registration.register().await {
            if let Err(release_error) = self.lock.release(&lease).await {
                warn!(instance = %self.name, error = %release_error, "failed to release lease after registration failure");
            }
            return Err(error);
        }

        let controller = self.controller.clone();
        let dispatch_task = tokio::spawn(async move {
            if let Err(error) = controller.start_up().await {
                error!(error = %error, "dispatch loop failed to start");
            }
        });

        let heartbeat = CancellationToken::new();
        let heartbeat_task = tokio::spawn(run_heartbeat(
            registration,
            lease.clone(),
            self.settings.renew_interval,
            heartbeat.clone(),
        ));

        let duties = CancellationToken::new();
        let election_role = election.subscribe();
        let election_task = tokio::spawn({
            let duties = duties.clone();
            async move { election.run(duties).await }
        });
        let liveness_task = tokio::spawn(run_liveness_log(
            self.lock.clone(),
            lease_key,
            self.settings.liveness_log_interval,
            duties.clone(),
            self.name.clone(),
        ));

        *runtime = Some(InstanceRuntime {
            lease,
            duties,
            heartbeat,
            election_role,
            dispatch_task,
            heartbeat_task,
            election_task,
            liveness_task,
        });
        self.state.send_replace(InstanceState::Live);

        info!(
            instance = %self.name,
            lease_ttl_ms = self.settings.lease_ttl.as_millis() as u64,
            "instance is live"
        );
        Ok(())
    }

    fn registration(&self) -> Registration {
        Registration {
            lock: self.lock.clone(),
            directory: self.directory.clone(),
            meta_key: self.keys.meta_lock_key(),
            name: self.name.clone(),
            lock_ttl: self.settings.registration_lock_ttl,
            timeout: self.settings.registration_timeout,
        }
    }

    /// Stops duties, drains the controller and releases the liveness lease.
    ///
    /// The heartbeat keeps running while workers drain.
    pub async fn shutdown(&self) -> AppResult<()> {
        let Some(runtime) = self.runtime.lock().await.take() else {
            return Ok(());
        };

        self.state.send_replace(InstanceState::ShuttingDown);
        info!(instance = %self.name, "instance shutting down");

        runtime.duties.cancel();
        log_join_failure(&self.name, "election", runtime.election_task.await);
        log_join_failure(&self.name, "liveness log", runtime.liveness_task.await);

        self.controller.shutdown().await;
        log_join_failure(&self.name, "dispatch loop", runtime.dispatch_task.await);

        runtime.heartbeat.cancel();
        log_join_failure(&self.name, "heartbeat", runtime.heartbeat_task.await);

        let released = self.lock.release(&runtime.lease).await;
        self.state.send_replace(InstanceState::Stopped);

        match &released {
            Ok(true) => info!(instance = %self.name, "instance stopped"),
            Ok(false) => warn!(instance = %self.name, "liveness lease was already gone at shutdown"),
            Err(error) => warn!(instance = %self.name, error = %error, "failed to release liveness lease"),
        }

        released.map(|_| ())
    }
}

/// Puts one instance into the shared instance list under the cluster lock.
#[derive(Clone)]
struct Registration {
    lock: DistributedLock,
    directory: InstanceDirectory,
    meta_key: String,
    name: InstanceName,
    lock_ttl: Duration,
    timeout: Duration,
}

impl Registration {
    async fn register(&self) -> AppResult<()> {
        let Some(meta) = self
            .lock
            .acquire_blocking(self.meta_key.as_str(), self.lock_ttl, self.timeout)
            .await?
        else {
            return Err(AppError::Unavailable(format!(
                "timed out waiting for cluster lock '{}' to register instance '{}'",
                self.meta_key, self.name
            )));
        };

        let appended = self.directory.append(&self.name).await;
        if let Err(error) = self.lock.release(&meta).await {
            warn!(instance = %self.name, error = %error, "failed to release cluster lock after registration");
        }

        if appended? {
            info!(instance = %self.name, "instance added to instance list");
        }

        Ok(())
    }
}

/// Renews the liveness lease until `stop` fires.
///
/// A lease that lapsed and was taken back may have been pruned from the
/// instance list by a scan in between, so the instance registers again
/// before it counts as fully live.
async fn run_heartbeat(
    registration: Registration,
    lease: Lease,
    renew_interval: Duration,
    stop: CancellationToken,
) {
    let instance_name = registration.name.clone();
    let mut ticker = tokio::time::interval(renew_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut needs_registration = false;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                match registration.lock.renew_expiration(&lease).await {
                    Ok(LeaseRenewal::Extended) => debug!(instance = %instance_name, "liveness lease renewed"),
                    Ok(LeaseRenewal::Reacquired) => {
                        warn!(instance = %instance_name, "liveness lease lapsed; registering again");
                        needs_registration = true;
                    }
                    Ok(LeaseRenewal::Lost) => error!(
                        instance = %instance_name,
                        "liveness lease is held by another owner"
                    ),
                    Err(error) => warn!(
                        instance = %instance_name,
                        error = %error,
                        "liveness lease renewal failed"
                    ),
                }

                if needs_registration {
                    match registration.register().await {
                        Ok(()) => needs_registration = false,
                        Err(error) => warn!(
                            instance = %instance_name,
                            error = %error,
                            "re-registration failed; retrying on next heartbeat"
                        ),
                    }
                }
            }
        }
    }
}

async fn run_liveness_log(
    lock: DistributedLock,
    lease_key: String,
    period: Duration,
    stop: CancellationToken,
    instance_name: InstanceName,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = stop.cancelled() => break,
            _ = ticker.tick() => {
                match lock.is_expired(lease_key.as_str()).await {
                    Ok(expired) => info!(instance = %instance_name, live = !expired, "instance liveness"),
                    Err(error) => warn!(instance = %instance_name, error = %error, "liveness check failed"),
                }
            }
        }
    }
}

fn log_join_failure(
    instance_name: &InstanceName,
    task: &str,
    joined: Result<(), tokio::task::JoinError>,
) {
    if let Err(error) = joined {
        warn!(instance = %instance_name, task, error = %error, "background task ended abnormally");
    }
}
