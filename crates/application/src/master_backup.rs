//! Master/backup leader election over a single lease key.
//!
//! Every participant runs the same job; whoever holds the lease is master and
//! the rest stay backup until the lease lapses.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kestrel_core::{AppError, AppResult};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::distributed_lock::{DistributedLock, Lease};

/// Callbacks fired when the local participant changes role.
#[async_trait]
pub trait RoleTransitionHandler: Send + Sync {
    /// Called after this participant became master.
    async fn on_promoted(&self);

    /// Called after this participant stopped being master.
    async fn on_demoted(&self);
}

/// Current role of one election participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionRole {
    /// Holds the lease.
    Master,
    /// Waits for the lease.
    Backup,
}

impl ElectionRole {
    /// Returns the display value of the role.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Master => "master",
            Self::Backup => "backup",
        }
    }
}

/// Timing of one election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionSettings {
    /// How often a backup tries to take the lease.
    pub attempt_interval: Duration,
    /// Lease duration.
    pub lease_ttl: Duration,
    /// How often the master renews; must be shorter than the lease.
    pub renew_interval: Duration,
    /// Acquisition attempts per tick when the store errors.
    pub lock_attempts: u32,
    /// Renewal attempts per tick when the store errors.
    pub renew_attempts: u32,
    /// Pause between failed attempts.
    pub retry_interval: Duration,
}

impl Default for ElectionSettings {
    fn default() -> Self {
        Self {
            attempt_interval: Duration::from_secs(15),
            lease_ttl: Duration::from_secs(6),
            renew_interval: Duration::from_secs(3),
            lock_attempts: 3,
            renew_attempts: 3,
            retry_interval: Duration::from_millis(100),
        }
    }
}

/// One participant of a named election.
pub struct MasterBackupJob {
    job_key: String,
    lock: DistributedLock,
    handler: Arc<dyn RoleTransitionHandler>,
    settings: ElectionSettings,
    role: watch::Sender<ElectionRole>,
}

impl MasterBackupJob {
    /// Creates a participant that competes for `job_key`.
    pub fn new(
        job_key: impl Into<String>,
        lock: DistributedLock,
        handler: Arc<dyn RoleTransitionHandler>,
        settings: ElectionSettings,
    ) -> AppResult<Self> {
        if settings.renew_interval >= settings.lease_ttl {
            return Err(AppError::Validation(
                "election renew interval must be shorter than the lease ttl".to_owned(),
            ));
        }

        if settings.attempt_interval.is_zero() || settings.renew_interval.is_zero() {
            return Err(AppError::Validation(
                "election intervals must be greater than zero".to_owned(),
            ));
        }

        let (role, _) = watch::channel(ElectionRole::Backup);
        Ok(Self {
            job_key: job_key.into(),
            lock,
            handler,
            settings,
            role,
        })
    }

    /// Returns the current role.
    #[must_use]
    pub fn role(&self) -> ElectionRole {
        *self.role.borrow()
    }

    /// Subscribes to role changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ElectionRole> {
        self.role.subscribe()
    }

    /// Competes for the lease until `shutdown` fires.
    ///
    /// A master that is shut down is demoted and releases its lease.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt_ticker = tokio::time::interval(self.settings.attempt_interval);
        attempt_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut renew_ticker = tokio::time::interval(self.settings.renew_interval);
        renew_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lease: Option<Lease> = None;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = attempt_ticker.tick(), if lease.is_none() => {
                    lease = self.try_promote().await;
                    if lease.is_some() {
                        renew_ticker.reset();
                    }
                }
                _ = renew_ticker.tick(), if lease.is_some() => {
                    let renewed = match lease.as_ref() {
                        Some(held) => self.renew(held).await,
                        None => false,
                    };
                    if !renewed {
                        lease = None;
                        self.demote().await;
                        attempt_ticker.reset();
                    }
                }
            }
        }

        if let Some(held) = lease.take() {
            self.demote().await;
            if let Err(error) = self.lock.release(&held).await {
                warn!(job = %self.job_key, error = %error, "failed to release election lease");
            }
        }
    }

    async fn try_promote(&self) -> Option<Lease> {
        let acquired = self
            .lock
            .try_lock_with_retries(
                self.job_key.as_str(),
                self.settings.lease_ttl,
                self.settings.lock_attempts,
                self.settings.retry_interval,
            )
            .await;

        match acquired {
            Ok(Some(lease)) => {
                self.role.send_replace(ElectionRole::Master);
                info!(job = %self.job_key, "promoted to master");
                self.handler.on_promoted().await;
                Some(lease)
            }
            Ok(None) => {
                debug!(job = %self.job_key, "election lease held elsewhere; staying backup");
                None
            }
            Err(error) => {
                warn!(job = %self.job_key, error = %error, "election attempt failed");
                None
            }
        }
    }

    async fn renew(&self, lease: &Lease) -> bool {
        let attempts = self.settings.renew_attempts.max(1);
        for attempt in 1..=attempts {
            match self.lock.renew_expiration(lease).await {
                Ok(renewal) if renewal.is_held() => return true,
                Ok(_) => {
                    warn!(job = %self.job_key, "election lease taken by another participant");
                    return false;
                }
                Err(error) => {
                    warn!(job = %self.job_key, attempt, error = %error, "election lease renewal failed");
                    if attempt < attempts {
                        tokio::time::sleep(self.settings.retry_interval).await;
                    }
                }
            }
        }

        false
    }

    async fn demote(&self) {
        self.role.send_replace(ElectionRole::Backup);
        info!(job = %self.job_key, "demoted to backup");
        self.handler.on_demoted().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use crate::distributed_lock::DistributedLock;
    use crate::test_support::FakeCoordinationStore;

    use super::{ElectionRole, ElectionSettings, MasterBackupJob, RoleTransitionHandler};

    const JOB_KEY: &str = "kestrel/takeover-master";

    #[derive(Default)]
    struct CountingTransitions {
        promoted: AtomicUsize,
        demoted: AtomicUsize,
    }

    #[async_trait]
    impl RoleTransitionHandler for CountingTransitions {
        async fn on_promoted(&self) {
            self.promoted.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_demoted(&self) {
            self.demoted.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_settings() -> ElectionSettings {
        ElectionSettings {
            attempt_interval: Duration::from_millis(20),
            lease_ttl: Duration::from_millis(300),
            renew_interval: Duration::from_millis(50),
            lock_attempts: 1,
            renew_attempts: 1,
            retry_interval: Duration::from_millis(1),
        }
    }

    fn build_job(
        store: &Arc<FakeCoordinationStore>,
    ) -> (Arc<CountingTransitions>, Arc<MasterBackupJob>) {
        let transitions = Arc::new(CountingTransitions::default());
        let job = MasterBackupJob::new(
            JOB_KEY,
            DistributedLock::new(store.clone()),
            transitions.clone(),
            fast_settings(),
        )
        .unwrap_or_else(|_| unreachable!());
        (transitions, Arc::new(job))
    }

    fn spawn_run(
        job: &Arc<MasterBackupJob>,
        shutdown: &CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let job = job.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { job.run(shutdown).await })
    }

    async fn wait_for_role(job: &MasterBackupJob, role: ElectionRole) {
        let mut receiver = job.subscribe();
        let reached = tokio::time::timeout(
            Duration::from_secs(2),
            receiver.wait_for(|current| *current == role),
        )
        .await;
        assert!(matches!(reached, Ok(Ok(_))));
    }

    #[tokio::test]
    async fn sole_participant_is_promoted_and_releases_on_shutdown() {
        let store = Arc::new(FakeCoordinationStore::default());
        let (transitions, job) = build_job(&store);
        let shutdown = CancellationToken::new();
        let running = spawn_run(&job, &shutdown);

        wait_for_role(&job, ElectionRole::Master).await;
        assert_eq!(transitions.promoted.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(job.role(), ElectionRole::Master);

        shutdown.cancel();
        assert!(running.await.is_ok());
        assert_eq!(transitions.demoted.load(Ordering::SeqCst), 1);
        assert_eq!(job.role(), ElectionRole::Backup);
        assert!(store.text(JOB_KEY).await.is_none());
    }

    #[tokio::test]
    async fn only_one_of_two_participants_becomes_master() {
        let store = Arc::new(FakeCoordinationStore::default());
        let (first_transitions, first) = build_job(&store);
        let (second_transitions, second) = build_job(&store);
        let shutdown = CancellationToken::new();
        let first_run = spawn_run(&first, &shutdown);
        let second_run = spawn_run(&second, &shutdown);

        tokio::time::sleep(Duration::from_millis(200)).await;

        let promotions = first_transitions.promoted.load(Ordering::SeqCst)
            + second_transitions.promoted.load(Ordering::SeqCst);
        assert_eq!(promotions, 1);
        assert_ne!(first.role(), second.role());

        shutdown.cancel();
        assert!(first_run.await.is_ok());
        assert!(second_run.await.is_ok());
    }

    #[tokio::test]
    async fn master_is_demoted_when_lease_is_taken() {
        let store = Arc::new(FakeCoordinationStore::default());
        let (transitions, job) = build_job(&store);
        let shutdown = CancellationToken::new();
        let running = spawn_run(&job, &shutdown);

        wait_for_role(&job, ElectionRole::Master).await;

        store.expire_key(JOB_KEY).await;
        store.put_persistent(JOB_KEY, "usurper").await;

        wait_for_role(&job, ElectionRole::Backup).await;
        assert_eq!(transitions.demoted.load(Ordering::SeqCst), 1);
        assert_eq!(store.text(JOB_KEY).await.as_deref(), Some("usurper"));

        shutdown.cancel();
        assert!(running.await.is_ok());
        assert_eq!(transitions.demoted.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn renew_interval_must_be_shorter_than_ttl() {
        let store = Arc::new(FakeCoordinationStore::default());
        let settings = ElectionSettings {
            renew_interval: Duration::from_secs(6),
            ..ElectionSettings::default()
        };

        let result = MasterBackupJob::new(
            JOB_KEY,
            DistributedLock::new(store),
            Arc::new(CountingTransitions::default()),
            settings,
        );
        assert!(result.is_err());
    }
}
