//! Dead-instance detection and reassignment of orphaned requests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::random::random_below;
use kestrel_core::{AppResult, InstanceName};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordination_ports::KeyNamespace;
use crate::distributed_lock::{DistributedLock, Lease};
use crate::instance_directory::InstanceDirectory;
use crate::master_backup::RoleTransitionHandler;
use crate::request_controller::RequestController;
use crate::request_registry::RequestRegistry;


/// Tunables of the cluster-lock gate around a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverSettings {
    /// Lease duration of the cluster lock while scanning.
    pub lock_ttl: Duration,
    /// Immediate acquisition attempts on store errors.
    pub lock_attempts: u32,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
}

impl Default for TakeoverSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(60),
            lock_attempts: 3,
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// Summary of one completed scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TakeoverReport {
    /// Peers whose lease was live.
    pub live_instances: Vec<InstanceName>,
    /// Peers whose lease had lapsed.
    pub dead_instances: Vec<InstanceName>,
    /// Requests moved to the scanning instance.
    pub reclaimed_requests: usize,
    /// Dead peers kept in the list because reassignment failed.
    pub retained_instances: Vec<InstanceName>,
}

/// Result of [`TakeoverScanner::scan_once`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another instance holds the cluster lock or the store was unreachable.
    Skipped,
    /// The scan ran under the cluster lock.
    Completed(TakeoverReport),
}

/// Finds dead peers and moves their in-flight requests to the local instance.
#[derive(Clone)]
pub struct TakeoverScanner {
    lock: DistributedLock,
    directory: InstanceDirectory,
    registry: RequestRegistry,
    keys: KeyNamespace,
    controller: Arc<RequestController>,
    settings: TakeoverSettings,
}

impl TakeoverScanner {
    /// Creates a scanner feeding reclaimed requests into `controller`.
    #[must_use]
    pub fn new(
        lock: DistributedLock,
        directory: InstanceDirectory,
        registry: RequestRegistry,
        keys: KeyNamespace,
        controller: Arc<RequestController>,
        settings: TakeoverSettings,
    ) -> Self {
        Self {
            lock,
            directory,
            registry,
            keys,
            controller,
            settings,
        }
    }

    fn local_instance(&self) -> &InstanceName {
        self.controller.instance_name()
    }

    /// Runs one scan under the cluster lock.
    pub async fn scan_once(&self) -> AppResult<ScanOutcome> {
        let meta_key = self.keys.meta_lock_key();
        let acquired = self
            .lock
            .try_lock_with_retries(
                meta_key.as_str(),
                self.settings.lock_ttl,
                self.settings.lock_attempts,
                self.settings.retry_interval,
            )
            .await;

        let lease = match acquired {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(instance = %self.local_instance(), "cluster lock busy; skipping scan");
                return Ok(ScanOutcome::Skipped);
            }
            Err(error) => {
                warn!(instance = %self.local_instance(), error = %error, "cluster lock unavailable; skipping scan");
                return Ok(ScanOutcome::Skipped);
            }
        };

        let result = self.scan_locked(&lease).await;

        if let Err(error) = self.lock.release(&lease).await {
            warn!(instance = %self.local_instance(), error = %error, "failed to release cluster lock");
        }

        result.map(ScanOutcome::Completed)
    }

    async fn scan_locked(&self, lease: &Lease) -> AppResult<TakeoverReport> {
        let local = self.local_instance().clone();
        let listed = self.directory.list().await?;

        let mut report = TakeoverReport::default();
        for name in &listed {
            if *name == local {
                continue;
            }

            let lease_key = self.keys.instance_lease_key(name);
            match self.lock.is_expired(lease_key.as_str()).await {
                Ok(true) => report.dead_instances.push(name.clone()),
                Ok(false) => report.live_instances.push(name.clone()),
                Err(error) => {
                    warn!(instance = %name, error = %error, "lease check failed; treating instance as live");
                    report.live_instances.push(name.clone());
                }
            }
        }

        let mut takeovers = JoinSet::new();
        for dead in report.dead_instances.clone() {
            let scanner = self.clone();
            takeovers.spawn(async move {
                let result = scanner.take_over_instance(&dead).await;
                (dead, result)
            });
        }

        let mut completed = HashSet::new();
        while let Some(joined) = takeovers.join_next().await {
            match joined {
                Ok((dead, Ok(count))) => {
                    report.reclaimed_requests += count;
                    completed.insert(dead);
                }
                Ok((dead, Err(error))) => {
                    warn!(instance = %dead, error = %error, "takeover failed; instance kept for next scan");
                }
                Err(error) => {
                    warn!(error = %error, "takeover task aborted");
                }
            }
        }

        report.retained_instances = report
            .dead_instances
            .iter()
            .filter(|dead| !completed.contains(*dead))
            .cloned()
            .collect();

        // Takeovers can outlast the cluster lock; never rewrite the list without it.
        let held = match self.lock.renew_expiration(lease).await {
            Ok(renewal) => renewal.is_held(),
            Err(error) => {
                warn!(instance = %local, error = %error, "cluster lock renewal failed");
                false
            }
        };
        if held {
            self.prune_completed(&local, &completed).await?;
        } else {
            warn!(instance = %local, "cluster lock lost during scan; instance list left for next scan");
        }

        info!(
            instance = %local,
            live = report.live_instances.len(),
            dead = report.dead_instances.len(),
            reclaimed = report.reclaimed_requests,
            retained = report.retained_instances.len(),
            "takeover scan completed"
        );
        Ok(report)
    }

    /// Drops `completed` from the list as it is now, keeping peers that joined mid-scan.
    async fn prune_completed(
        &self,
        local: &InstanceName,
        completed: &HashSet<InstanceName>,
    ) -> AppResult<()> {
        let mut next_list: Vec<InstanceName> = self
            .directory
            .list()
            .await?
            .into_iter()
            .filter(|name| name == local || !completed.contains(name))
            .collect();
        if !next_list.contains(local) {
            next_list.push(local.clone());
        }
        self.directory.replace(&next_list).await
    }

    /// Moves every request of `dead` to the local instance and queues it.
    pub async fn take_over_instance(&self, dead: &InstanceName) -> AppResult<usize> {
        let local = self.local_instance().clone();
        let handlers = self.controller.handlers();
        let requests = self
            .registry
            .list_requests_for_instance(dead, &handlers.prefixes())
            .await?;

        let mut reclaimed = 0;
        for mut request in requests {
            let handler = handlers.resolve(request.request_type())?;
            handler.handle_take_over_request(&mut request, &local).await?;

            info!(
                request = %request.name(),
                request_type = %request.request_type(),
                from = %dead,
                to = %local,
                "request taken over"
            );
            self.controller.enqueue(request).await;
            reclaimed += 1;
        }

        Ok(reclaimed)
    }
}

/// Jittered delay between two scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSchedule {
    /// Minimum delay.
    pub base_interval: Duration,
    /// Upper bound of the random extra delay.
    pub jitter: Duration,
}

impl ScanSchedule {
    /// Draws the next delay in `base_interval..base_interval + jitter`.
    #[must_use]
    pub fn next_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        self.base_interval + Duration::from_millis(random_below(jitter_ms))
    }
}

/// Periodic scan loop that runs only while the local instance is master.
pub struct TakeoverDuty {
    scanner: TakeoverScanner,
    schedule: ScanSchedule,
    active: Mutex<Option<CancellationToken>>,
}

impl TakeoverDuty {
    /// Creates a duty scanning on `schedule`.
    #[must_use]
    pub fn new(scanner: TakeoverScanner, schedule: ScanSchedule) -> Self {
        Self {
            scanner,
            schedule,
            active: Mutex::new(None),
        }
    }

    /// Returns whether the scan loop is running.
    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }
}

#[async_trait]
impl RoleTransitionHandler for TakeoverDuty {
    async fn on_promoted(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self.active.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let scanner = self.scanner.clone();
        let schedule = self.schedule;
        tokio::spawn(async move {
            info!(instance = %scanner.local_instance(), "takeover duty started");
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(schedule.next_delay()) => {}
                }

                if let Err(error) = scanner.scan_once().await {
                    warn!(instance = %scanner.local_instance(), error = %error, "takeover scan failed");
                }
            }
            info!(instance = %scanner.local_instance(), "takeover duty stopped");
        });
    }

    async fn on_demoted(&self) {
        if let Some(token) = self.active.lock().await.take() {
            token.cancel();
        }
    }
}
