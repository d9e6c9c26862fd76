//! Periodic resubmission.

use buildgate_core::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::deferral::DeferralService;

/// Calls `resubmit` on a fixed interval until told to stop.
pub struct ResubmitDriver {
    deferrals: Arc<dyn DeferralService>,
    period: Duration,
}

impl ResubmitDriver {
    pub fn new(deferrals: Arc<dyn DeferralService>, period: Duration) -> Self {
        Self { deferrals, period }
    }

    /// Run the resubmit loop.
    ///
    /// Stops when `shutdown` turns true or its sender is dropped, or when the
    /// relay has no consumer left.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(period = ?self.period, "Starting resubmit driver");

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.deferrals.resubmit().await {
                        Ok(0) => debug!("Nothing to resubmit"),
                        Ok(relayed) => debug!(relayed, "Resubmit pass finished"),
                        Err(Error::RelayClosed) => {
                            warn!("Relay closed, stopping resubmit driver");
                            break;
                        }
                        Err(e) => warn!(error = %e, "Resubmit pass failed"),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Resubmit driver stopped");
    }
}
