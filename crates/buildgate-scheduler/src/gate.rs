//! Build admission: lock or defer.

use async_trait::async_trait;
use buildgate_core::{Deferral, Error, Result, UserBuildEvent};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::deferral::DeferralService;
use crate::lock::DistributedLockService;
use crate::relay::Dispatcher;

/// Starts a build once its lock is held.
#[async_trait]
pub trait BuildLauncher: Send + Sync {
    async fn launch(&self, event: &UserBuildEvent, build_id: &str) -> Result<()>;
}

/// Outcome of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The lock was taken and the build launched.
    Proceed { build_id: String },
    /// Another build holds the lock; the trigger was queued.
    Deferred { build_id: String },
}

impl Admission {
    pub fn build_id(&self) -> &str {
        match self {
            Admission::Proceed { build_id } | Admission::Deferred { build_id } => build_id,
        }
    }
}

/// Front door for build triggers.
pub struct BuildGate {
    locks: Arc<dyn DistributedLockService>,
    deferrals: Arc<dyn DeferralService>,
    launcher: Arc<dyn BuildLauncher>,
}

impl BuildGate {
    pub fn new(
        locks: Arc<dyn DistributedLockService>,
        deferrals: Arc<dyn DeferralService>,
        launcher: Arc<dyn BuildLauncher>,
    ) -> Self {
        Self {
            locks,
            deferrals,
            launcher,
        }
    }

    /// Launch the build if its branch is free, otherwise defer it.
    ///
    /// Every submission gets a fresh build id, so a trigger that is deferred
    /// again after a resubmit is not swallowed by the queue's dedup window.
    pub async fn submit(&self, event: &UserBuildEvent) -> Result<Admission> {
        let build_id = Uuid::new_v4().to_string();

        match self.locks.acquire(event).await {
            Ok(()) => {
                if let Err(e) = self.launcher.launch(event, &build_id).await {
                    error!(key = %event.hash(), build_id = %build_id, error = %e, "Launch failed, releasing lock");
                    if let Err(release) = self.locks.release(event).await {
                        error!(key = %event.hash(), error = %release, "Failed to release lock");
                    }
                    return Err(e);
                }
                info!(key = %event.hash(), build_id = %build_id, "Build launched");
                Ok(Admission::Proceed { build_id })
            }
            Err(Error::AlreadyLocked(held)) => {
                self.deferrals
                    .defer(&event.key(), &event.branch(), &build_id)
                    .await?;
                info!(key = %event.hash(), build_id = %build_id, held = %held, "Build deferred");
                Ok(Admission::Deferred { build_id })
            }
            Err(e) => Err(e),
        }
    }

    /// The build for `event` finished; free its branch.
    pub async fn complete(&self, event: &UserBuildEvent) -> Result<()> {
        self.locks.release(event).await
    }
}

#[async_trait]
impl Dispatcher for BuildGate {
    async fn dispatch(&self, deferral: Deferral) -> Result<()> {
        let event = UserBuildEvent::from_deferral(&deferral)?;
        let admission = self.submit(&event).await?;
        info!(
            key = %deferral.key(),
            deferred_at = deferral.unix_time,
            admission = ?admission,
            "Dispatched deferred build"
        );
        Ok(())
    }
}
