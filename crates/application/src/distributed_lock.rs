//! Lease-based mutual exclusion over the coordination store.

use std::sync::Arc;
use std::time::Duration;

use kestrel_core::{AppError, AppResult};
use tracing::{debug, warn};

use crate::coordination_ports::{CoordinationStore, KeyTtl};

/// Poll interval used by [`DistributedLock::acquire_blocking`].
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Ownership of one held lease.
///
/// The token is unique per acquisition; only the holder of the token may
/// renew or release the lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    key: String,
    token: String,
    ttl: Duration,
}

impl Lease {
    /// Returns the locked key.
    #[must_use]
    pub fn key(&self) -> &str {
        self.key.as_str()
    }

    /// Returns the ownership token stored under the key.
    #[must_use]
    pub fn token(&self) -> &str {
        self.token.as_str()
    }

    /// Returns the lease duration used on acquisition and renewal.
    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Outcome of [`DistributedLock::renew_expiration`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseRenewal {
    /// The lease was still held and its expiry was pushed back.
    Extended,
    /// The lease had lapsed and was taken again under the same token.
    Reacquired,
    /// Another holder owns the key.
    Lost,
}

impl LeaseRenewal {
    /// Returns whether the caller holds the lease after renewal.
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Extended | Self::Reacquired)
    }
}

/// Acquire, renew and release of TTL leases.
#[derive(Clone)]
pub struct DistributedLock {
    store: Arc<dyn CoordinationStore>,
}

impl DistributedLock {
    /// Creates a lock service over a coordination store.
    #[must_use]
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    /// Attempts to acquire `key` once.
    ///
    /// Returns `None` when another holder owns the key.
    pub async fn lock_key(&self, key: &str, ttl: Duration) -> AppResult<Option<Lease>> {
        validate_lease_input(key, ttl)?;

        let token = uuid::Uuid::new_v4().to_string();
        let acquired = self
            .store
            .set_if_absent(key, token.as_str(), ttl)
            .await?;
        if !acquired {
            return Ok(None);
        }

        debug!(lock_key = %key, ttl_ms = ttl.as_millis() as u64, "lease acquired");
        Ok(Some(Lease {
            key: key.to_owned(),
            token,
            ttl,
        }))
    }

    /// Extends a held lease.
    ///
    /// When the lease already expired and nobody else took the key, it is
    /// re-acquired under the same token. A key owned by another holder is
    /// never touched.
    pub async fn renew_expiration(&self, lease: &Lease) -> AppResult<LeaseRenewal> {
        validate_lease_input(lease.key(), lease.ttl)?;

        if self
            .store
            .expire_if_value(lease.key(), lease.token(), lease.ttl)
            .await?
        {
            return Ok(LeaseRenewal::Extended);
        }

        let reacquired = self
            .store
            .set_if_absent(lease.key(), lease.token(), lease.ttl)
            .await?;
        if !reacquired {
            return Ok(LeaseRenewal::Lost);
        }

        warn!(lock_key = %lease.key(), "lease expired before renewal and was re-acquired");
        Ok(LeaseRenewal::Reacquired)
    }

    /// Returns whether `key` has no live lease.
    ///
    /// A key without an expiry counts as expired: a lease that can never
    /// lapse is treated as a crashed writer's leftover.
    pub async fn is_expired(&self, key: &str) -> AppResult<bool> {
        Ok(match self.store.ttl(key).await? {
            KeyTtl::Missing | KeyTtl::Persistent => true,
            KeyTtl::ExpiresIn(_) => false,
        })
    }

    /// Releases a held lease. Returns `false` when the lease was no longer held.
    pub async fn release(&self, lease: &Lease) -> AppResult<bool> {
        let released = self
            .store
            .delete_if_value(lease.key(), lease.token())
            .await?;
        if released {
            debug!(lock_key = %lease.key(), "lease released");
        }

        Ok(released)
    }

    /// Attempts [`Self::lock_key`] up to `attempts` times, sleeping between
    /// attempts that failed with a store error.
    ///
    /// A clean "held by someone else" answer is returned immediately.
    pub async fn try_lock_with_retries(
        &self,
        key: &str,
        ttl: Duration,
        attempts: u32,
        retry_interval: Duration,
    ) -> AppResult<Option<Lease>> {
        let attempts = attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.lock_key(key, ttl).await {
                Ok(lease) => return Ok(lease),
                Err(AppError::Validation(message)) => return Err(AppError::Validation(message)),
                Err(error) => {
                    warn!(lock_key = %key, attempt, error = %error, "lease acquisition attempt failed");
                    last_error = Some(error);
                    if attempt < attempts {
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            AppError::Internal(format!("lease acquisition for '{key}' made no attempt"))
        }))
    }

    /// Polls `key` until acquired or until `timeout` elapses.
    ///
    /// Returns `Ok(None)` on timeout. A key found without expiry is given
    /// `ttl` so that a crashed holder cannot block the fleet forever.
    pub async fn acquire_blocking(
        &self,
        key: &str,
        ttl: Duration,
        timeout: Duration,
    ) -> AppResult<Option<Lease>> {
        validate_lease_input(key, ttl)?;
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if let Some(lease) = self.lock_key(key, ttl).await? {
                return Ok(Some(lease));
            }

            if self.store.ttl(key).await? == KeyTtl::Persistent {
                warn!(lock_key = %key, "lock key had no expiry; applying lease ttl");
                self.store.expire(key, ttl).await?;
            }

            if tokio::time::Instant::now() + LOCK_POLL_INTERVAL > deadline {
                return Ok(None);
            }

            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }
}

fn validate_lease_input(key: &str, ttl: Duration) -> AppResult<()> {
    if key.trim().is_empty() {
        return Err(AppError::Validation(
            "lease key must not be empty".to_owned(),
        ));
    }

    if ttl.is_zero() {
        return Err(AppError::Validation(
            "lease ttl must be greater than zero".to_owned(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use kestrel_core::AppError;

    use crate::coordination_ports::CoordinationStore;
    use crate::test_support::FakeCoordinationStore;

    use super::{DistributedLock, LeaseRenewal};

    const TTL: Duration = Duration::from_secs(5);

    fn build_lock() -> (Arc<FakeCoordinationStore>, DistributedLock) {
        let store = Arc::new(FakeCoordinationStore::default());
        (store.clone(), DistributedLock::new(store))
    }

    #[tokio::test]
    async fn second_holder_cannot_acquire_held_key() {
        let (_, lock) = build_lock();

        let first = lock.lock_key("ns/meta", TTL).await;
        assert!(matches!(first, Ok(Some(_))));
        let second = lock.lock_key("ns/meta", TTL).await;
        assert!(matches!(second, Ok(None)));
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let (store, lock) = build_lock();
        let lease = lock
            .lock_key("ns/meta", TTL)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());

        store.expire_key("ns/meta").await;
        let intruder = lock
            .lock_key("ns/meta", TTL)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());

        assert!(matches!(lock.release(&lease).await, Ok(false)));
        assert_eq!(store.text("ns/meta").await.as_deref(), Some(intruder.token()));
        assert!(matches!(lock.release(&intruder).await, Ok(true)));
        assert!(matches!(lock.is_expired("ns/meta").await, Ok(true)));
    }

    #[tokio::test]
    async fn renew_reacquires_lapsed_lease_with_same_token() {
        let (store, lock) = build_lock();
        let lease = lock
            .lock_key("ns/instances/alpha001", TTL)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());

        assert!(matches!(
            lock.renew_expiration(&lease).await,
            Ok(LeaseRenewal::Extended)
        ));

        store.expire_key("ns/instances/alpha001").await;

        assert!(matches!(
            lock.renew_expiration(&lease).await,
            Ok(LeaseRenewal::Reacquired)
        ));
        assert_eq!(
            store.text("ns/instances/alpha001").await.as_deref(),
            Some(lease.token())
        );
    }

    #[tokio::test]
    async fn renew_does_not_touch_key_owned_by_another_holder() {
        let (store, lock) = build_lock();
        let lease = lock
            .lock_key("ns/takeover-master", TTL)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());

        store.expire_key("ns/takeover-master").await;
        let usurper = lock
            .lock_key("ns/takeover-master", TTL)
            .await
            .unwrap_or_else(|_| unreachable!())
            .unwrap_or_else(|| unreachable!());

        assert!(matches!(
            lock.renew_expiration(&lease).await,
            Ok(LeaseRenewal::Lost)
        ));
        assert_eq!(
            store.text("ns/takeover-master").await.as_deref(),
            Some(usurper.token())
        );
    }

    #[tokio::test]
    async fn persistent_key_counts_as_expired() {
        let (store, lock) = build_lock();
        store.put_persistent("ns/instances/ghost", "token").await;

        assert!(matches!(lock.is_expired("ns/instances/ghost").await, Ok(true)));
        assert!(matches!(lock.is_expired("ns/instances/absent").await, Ok(true)));

        assert!(matches!(lock.lock_key("ns/instances/live", TTL).await, Ok(Some(_))));
        assert!(matches!(lock.is_expired("ns/instances/live").await, Ok(false)));
    }

    #[tokio::test]
    async fn acquire_blocking_repairs_key_without_expiry() {
        let (store, lock) = build_lock();
        store.put_persistent("ns/meta", "crashed-writer").await;

        let result = lock
            .acquire_blocking("ns/meta", Duration::from_millis(30), Duration::from_secs(2))
            .await;

        assert!(matches!(result, Ok(Some(_))));
        assert!(store.ttl("ns/meta").await.is_ok());
    }

    #[tokio::test]
    async fn acquire_blocking_times_out_while_key_is_held() {
        let (_, lock) = build_lock();
        assert!(matches!(lock.lock_key("ns/meta", TTL).await, Ok(Some(_))));

        let result = lock
            .acquire_blocking("ns/meta", TTL, Duration::from_millis(50))
            .await;

        assert!(matches!(result, Ok(None)));
    }

    #[tokio::test]
    async fn retries_surface_last_store_error() {
        let (store, lock) = build_lock();
        store.set_unavailable(true);

        let result = lock
            .try_lock_with_retries("ns/meta", TTL, 3, Duration::from_millis(1))
            .await;

        assert!(matches!(result, Err(AppError::Unavailable(_))));
    }

    #[tokio::test]
    async fn empty_key_and_zero_ttl_are_rejected() {
        let (_, lock) = build_lock();

        assert!(matches!(
            lock.lock_key(" ", TTL).await,
            Err(AppError::Validation(_))
        ));
        assert!(matches!(
            lock.lock_key("ns/meta", Duration::ZERO).await,
            Err(AppError::Validation(_))
        ));
    }
}
