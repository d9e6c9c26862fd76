//! Distributed lock service over a lease store.
//!
//! A lock is keyed by the event hash (`team/project/branch`). There is no
//! heartbeat: once a lock is older than the TTL, the next acquirer swaps it
//! out for its own, which is how a crashed holder's lock gets reclaimed.

use async_trait::async_trait;
use buildgate_core::{Clock, Error, LeaseStore, Lock, ResourceKey, Result, Retry, UserBuildEvent};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Exclusive per-branch build locks.
#[async_trait]
pub trait DistributedLockService: Send + Sync {
    /// Take the lock for `event.hash()`. Fails with [`Error::AlreadyLocked`]
    /// while another unexpired lock exists.
    async fn acquire(&self, event: &UserBuildEvent) -> Result<()>;

    /// Drop the lock for `event.hash()`. Releasing an unlocked key succeeds.
    async fn release(&self, event: &UserBuildEvent) -> Result<()>;
}

/// Lock service backed by a [`LeaseStore`].
pub struct LeaseLockService {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
    retry: Retry,
}

impl LeaseLockService {
    pub fn new(
        store: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        retry: Retry,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            retry,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current lock for the event, expired or not.
    pub async fn lock_for(&self, event: &UserBuildEvent) -> Result<Option<Lock>> {
        let key = ResourceKey::from(event);
        self.retry.run(|| self.store.get(&key)).await
    }

    async fn try_create(&self, key: &ResourceKey, now: i64) -> Result<bool> {
        self.retry.run(|| self.store.create_if_absent(key, now)).await
    }
}

#[async_trait]
impl DistributedLockService for LeaseLockService {
    async fn acquire(&self, event: &UserBuildEvent) -> Result<()> {
        let key = ResourceKey::from(event);
        let now = self.clock.now_unix();

        if self.try_create(&key, now).await? {
            info!(key = %key, "Acquired lock");
            return Ok(());
        }

        let existing = self.retry.run(|| self.store.get(&key)).await?;
        match existing {
            // Released between our create and our read.
            None => {
                if self.try_create(&key, now).await? {
                    info!(key = %key, "Acquired lock");
                    Ok(())
                } else {
                    Err(Error::AlreadyLocked(key.to_string()))
                }
            }
            Some(lock) if lock.is_expired(now, self.ttl) => {
                let swapped = self
                    .retry
                    .run(|| self.store.replace_if(&key, lock.created, now))
                    .await?;
                if swapped {
                    warn!(
                        key = %key,
                        created = lock.created,
                        expired = lock.expires(self.ttl),
                        "Preempted expired lock"
                    );
                    Ok(())
                } else {
                    debug!(key = %key, "Lost preemption race");
                    Err(Error::AlreadyLocked(key.to_string()))
                }
            }
            Some(lock) => {
                debug!(key = %key, created = lock.created, "Lock is held");
                Err(Error::AlreadyLocked(format!(
                    "{} (held since {}, expires {})",
                    key,
                    lock.created,
                    lock.expires(self.ttl)
                )))
            }
        }
    }

    async fn release(&self, event: &UserBuildEvent) -> Result<()> {
        let key = ResourceKey::from(event);
        self.retry.run(|| self.store.delete(&key)).await?;
        info!(key = %key, "Released lock");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgate_core::memory::MemoryLeaseStore;
    use buildgate_core::{ManualClock, NoBackoff};

    const TTL: Duration = Duration::from_secs(600);

    fn event(branch: &str) -> UserBuildEvent {
        UserBuildEvent::new("team", "lib", vec![branch.to_string()])
    }

    fn service() -> (Arc<MemoryLeaseStore>, Arc<ManualClock>, LeaseLockService) {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let service = LeaseLockService::new(
            store.clone(),
            clock.clone(),
            TTL,
            Retry::new(3, NoBackoff),
        );
        (store, clock, service)
    }

    #[tokio::test]
    async fn test_acquire_release_reacquire() {
        let (_store, _clock, locks) = service();
        let master = event("master");

        locks.acquire(&master).await.unwrap();
        let second = locks.acquire(&master).await;
        assert!(matches!(second, Err(Error::AlreadyLocked(_))));

        locks.release(&master).await.unwrap();
        locks.acquire(&master).await.unwrap();
    }

    #[tokio::test]
    async fn test_branches_lock_independently() {
        let (store, _clock, locks) = service();
        locks.acquire(&event("master")).await.unwrap();
        locks.acquire(&event("develop")).await.unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_release_without_lock_is_noop() {
        let (_store, _clock, locks) = service();
        locks.release(&event("master")).await.unwrap();
        locks.release(&event("master")).await.unwrap();
    }

    #[tokio::test]
    async fn test_held_until_expiry() {
        let (_store, clock, locks) = service();
        let master = event("master");
        locks.acquire(&master).await.unwrap();

        clock.advance(TTL - Duration::from_secs(1));
        assert!(locks.acquire(&master).await.unwrap_err().is_already_locked());
    }

    #[tokio::test]
    async fn test_expired_lock_is_preempted() {
        let (_store, clock, locks) = service();
        let master = event("master");
        locks.acquire(&master).await.unwrap();

        clock.advance(TTL);
        locks.acquire(&master).await.unwrap();

        let lock = locks.lock_for(&master).await.unwrap().unwrap();
        assert_eq!(lock.created, 1_000 + TTL.as_secs() as i64);
        assert!(locks.acquire(&master).await.unwrap_err().is_already_locked());
    }

    #[tokio::test]
    async fn test_preemption_by_second_service() {
        let store = Arc::new(MemoryLeaseStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let first = LeaseLockService::new(store.clone(), clock.clone(), TTL, Retry::once());
        let second = LeaseLockService::new(store.clone(), clock.clone(), TTL, Retry::once());
        let master = event("master");

        first.acquire(&master).await.unwrap();
        assert!(second.acquire(&master).await.is_err());

        clock.advance(TTL + Duration::from_secs(5));
        second.acquire(&master).await.unwrap();
        assert!(first.acquire(&master).await.is_err());
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, _clock, locks) = service();
        store.fail_next(2);
        locks.acquire(&event("master")).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_transport_error() {
        let (store, _clock, locks) = service();
        store.fail_next(3);
        let result = locks.acquire(&event("master")).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }
}
