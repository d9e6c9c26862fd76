//! Consumer side of the relay channel.

use async_trait::async_trait;
use buildgate_core::{Deferral, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Re-attempts a deferred build.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, deferral: Deferral) -> Result<()>;
}

/// Feeds relayed deferrals to a dispatcher, one at a time, until every
/// sender is gone.
pub struct RelayConsumer {
    relay: mpsc::Receiver<Deferral>,
    dispatcher: Arc<dyn Dispatcher>,
}

impl RelayConsumer {
    pub fn new(relay: mpsc::Receiver<Deferral>, dispatcher: Arc<dyn Dispatcher>) -> Self {
        Self { relay, dispatcher }
    }

    /// Run until the relay closes. Returns how many deferrals were
    /// dispatched successfully.
    pub async fn run(mut self) -> usize {
        info!("Starting relay consumer");
        let mut dispatched = 0;

        while let Some(deferral) = self.relay.recv().await {
            let key = deferral.key();
            let build_id = deferral.build_id.clone();
            match self.dispatcher.dispatch(deferral).await {
                Ok(()) => dispatched += 1,
                Err(e) => {
                    warn!(key = %key, build_id = %build_id, error = %e, "Failed to dispatch deferred build");
                }
            }
        }

        info!(dispatched, "Relay closed, consumer stopping");
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildgate_core::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(&self, deferral: Deferral) -> Result<()> {
            if deferral.branch == "broken" {
                return Err(Error::InvalidInput("broken".to_string()));
            }
            self.seen.lock().unwrap().push(deferral.key());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_consumer_drains_until_closed() {
        let (tx, rx) = mpsc::channel(4);
        let recorder = Arc::new(Recorder::default());
        let consumer = RelayConsumer::new(rx, recorder.clone());

        tx.send(Deferral::new("team/a", "master", "1", 1)).await.unwrap();
        tx.send(Deferral::new("team/b", "broken", "2", 2)).await.unwrap();
        tx.send(Deferral::new("team/c", "master", "3", 3)).await.unwrap();
        drop(tx);

        assert_eq!(consumer.run().await, 2);
        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec!["team/a/master".to_string(), "team/c/master".to_string()]
        );
    }
}
