//! Wiring of the coordinator from configuration.

use buildgate_config::GateConfig;
use buildgate_core::queue::QueueTransport;
use buildgate_core::{Clock, Deferral, LeaseStore, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

use crate::deferral::QueueDeferralService;
use crate::driver::ResubmitDriver;
use crate::gate::{BuildGate, BuildLauncher};
use crate::lock::LeaseLockService;
use crate::relay::RelayConsumer;

/// Lock service, deferral service and the relay between them and the
/// dispatcher, built from one [`GateConfig`].
pub struct Coordinator {
    locks: Arc<LeaseLockService>,
    deferrals: Arc<QueueDeferralService>,
    relay: Option<mpsc::Receiver<Deferral>>,
    resubmit_interval: Duration,
}

impl Coordinator {
    pub async fn from_config(
        config: &GateConfig,
        transport: Arc<dyn QueueTransport>,
        leases: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let retry = config.retry.to_retry();
        let (relay_tx, relay_rx) = mpsc::channel(config.resubmit.relay_capacity.max(1));

        let locks = LeaseLockService::new(leases, clock.clone(), config.lock.ttl, retry.clone());
        let deferrals =
            QueueDeferralService::new(transport, &config.queue.name, relay_tx, clock, retry)
                .await?
                .with_batch_size(config.queue.batch_size)
                .with_initial_delay(config.queue.initial_delay);

        info!(
            queue = %deferrals.queue_url(),
            lock_ttl = ?config.lock.ttl,
            resubmit_interval = ?config.resubmit.interval,
            "Coordinator configured"
        );

        Ok(Self {
            locks: Arc::new(locks),
            deferrals: Arc::new(deferrals),
            relay: Some(relay_rx),
            resubmit_interval: config.resubmit.interval,
        })
    }

    pub fn locks(&self) -> Arc<LeaseLockService> {
        self.locks.clone()
    }

    pub fn deferrals(&self) -> Arc<QueueDeferralService> {
        self.deferrals.clone()
    }

    /// Admission gate launching through `launcher`.
    pub fn gate(&self, launcher: Arc<dyn BuildLauncher>) -> BuildGate {
        BuildGate::new(self.locks.clone(), self.deferrals.clone(), launcher)
    }

    pub fn driver(&self) -> ResubmitDriver {
        ResubmitDriver::new(self.deferrals.clone(), self.resubmit_interval)
    }

    /// Take the receiving end of the relay. Only the first call gets it.
    pub fn take_relay(&mut self) -> Option<mpsc::Receiver<Deferral>> {
        self.relay.take()
    }

    /// Consumer feeding the relay into `gate`, or `None` once the relay has
    /// been taken.
    pub fn consumer(&mut self, gate: Arc<BuildGate>) -> Option<RelayConsumer> {
        self.take_relay().map(|relay| RelayConsumer::new(relay, gate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deferral::DeferralService;
    use crate::gate::Admission;
    use async_trait::async_trait;
    use buildgate_config::parse_gate_config;
    use buildgate_core::memory::{MemoryLeaseStore, MemoryQueue};
    use buildgate_core::{ManualClock, UserBuildEvent};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingLauncher {
        launched: AtomicUsize,
    }

    #[async_trait]
    impl BuildLauncher for CountingLauncher {
        async fn launch(&self, _event: &UserBuildEvent, _build_id: &str) -> Result<()> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_coordinator_round_trip() {
        let config = parse_gate_config(
            r#"
            queue "ci-deferrals" {
                batch-size 5
            }
            lock {
                ttl-secs 120
            }
            retry {
                max-attempts 2
                initial-delay-ms 1
                max-delay-ms 2
            }
            "#,
        )
        .unwrap();
        let clock = Arc::new(ManualClock::new(0));
        let queue = Arc::new(MemoryQueue::new(clock.clone()));
        let mut coordinator = Coordinator::from_config(
            &config,
            queue.clone(),
            Arc::new(MemoryLeaseStore::new()),
            clock.clone(),
        )
        .await
        .unwrap();
        assert_eq!(coordinator.deferrals().queue_url(), "memory://ci-deferrals");
        assert_eq!(coordinator.locks().ttl(), Duration::from_secs(120));

        let launcher = Arc::new(CountingLauncher::default());
        let gate = Arc::new(coordinator.gate(launcher.clone()));
        let consumer = coordinator.consumer(gate.clone()).unwrap();
        assert!(coordinator.take_relay().is_none());

        let event = UserBuildEvent::new("team", "lib", vec!["master".to_string()]);
        assert!(matches!(
            gate.submit(&event).await.unwrap(),
            Admission::Proceed { .. }
        ));
        assert!(matches!(
            gate.submit(&event).await.unwrap(),
            Admission::Deferred { .. }
        ));
        gate.complete(&event).await.unwrap();

        // The gate keeps the relay sender alive, so the consumer runs until
        // aborted.
        let consumer = tokio::spawn(consumer.run());
        assert_eq!(coordinator.deferrals().resubmit().await.unwrap(), 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while launcher.launched.load(Ordering::SeqCst) < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        consumer.abort();

        assert!(queue.is_empty("memory://ci-deferrals"));
        // The dispatched build holds the branch now.
        assert!(matches!(
            gate.submit(&event).await.unwrap(),
            Admission::Deferred { .. }
        ));
    }
}
