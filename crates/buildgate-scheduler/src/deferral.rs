//! Deferral queue service.
//!
//! Builds that could not take their lock are parked on a durable queue.
//! A periodic [`resubmit`](DeferralService::resubmit) drains a batch, orders
//! it oldest first, collapses neighbouring duplicates and hands the survivors
//! to the dispatcher through a bounded relay channel.

use async_trait::async_trait;
use buildgate_core::deferral::sort_and_dedup;
use buildgate_core::queue::{MAX_RECEIVE_BATCH, QueueTransport, ReceiveRequest, ReceivedMessage};
use buildgate_core::{Clock, Deferral, Error, Result, Retry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

/// Park build triggers and feed them back to the dispatcher.
#[async_trait]
pub trait DeferralService: Send + Sync {
    /// Record a trigger for later. Repeats of `build_id` inside the queue's
    /// dedup window are dropped by the transport.
    async fn defer(&self, project_key: &str, branch: &str, build_id: &str) -> Result<()>;

    /// Drain one batch into the relay. Returns how many deferrals were
    /// relayed.
    async fn resubmit(&self) -> Result<usize>;

    /// Snapshot of what is waiting, ordered and deduplicated the same way
    /// `resubmit` would. Nothing is removed from the queue.
    ///
    /// The list is approximate: the depth it pages over is the transport's
    /// estimate, and a page that still fails after retries is logged and
    /// skipped, so the result may be incomplete.
    async fn deferred_builds(&self) -> Result<Vec<Deferral>>;
}

/// Deferral service over a [`QueueTransport`].
pub struct QueueDeferralService {
    transport: Arc<dyn QueueTransport>,
    queue_url: String,
    relay: mpsc::Sender<Deferral>,
    clock: Arc<dyn Clock>,
    retry: Retry,
    batch_size: usize,
    initial_delay: Option<Duration>,
    guard: Mutex<()>,
    /// Held across the relay loop so concurrent resubmits relay whole
    /// batches. Separate from `guard` so `defer` never waits on the relay.
    relay_guard: Mutex<()>,
}

impl QueueDeferralService {
    /// Create the queue if it does not exist yet and bind to it.
    pub async fn new(
        transport: Arc<dyn QueueTransport>,
        queue_name: &str,
        relay: mpsc::Sender<Deferral>,
        clock: Arc<dyn Clock>,
        retry: Retry,
    ) -> Result<Self> {
        let queue_url = retry.run(|| transport.create_queue(queue_name)).await?;
        info!(queue = %queue_url, "Deferral queue ready");

        Ok(Self {
            transport,
            queue_url,
            relay,
            clock,
            retry,
            batch_size: MAX_RECEIVE_BATCH,
            initial_delay: None,
            guard: Mutex::new(()),
            relay_guard: Mutex::new(()),
        })
    }

    /// Messages taken per `resubmit`, capped at the transport maximum.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_RECEIVE_BATCH);
        self
    }

    /// Keep new deferrals invisible for `delay` after they are recorded.
    pub fn with_initial_delay(mut self, delay: Option<Duration>) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Parse and delete each received message. Malformed ones stay queued.
    async fn take_batch(&self, messages: Vec<ReceivedMessage>) -> Vec<Deferral> {
        let mut taken = Vec::with_capacity(messages.len());
        for message in messages {
            let deferral = match Deferral::from_message(&message) {
                Ok(deferral) => deferral,
                Err(e) => {
                    warn!(
                        queue = %self.queue_url,
                        message_id = %message.message_id,
                        error = %e,
                        "Skipping malformed deferral"
                    );
                    continue;
                }
            };

            let handle = message.receipt_handle.as_str();
            if let Err(e) = self
                .retry
                .run(|| self.transport.delete(&self.queue_url, handle))
                .await
            {
                warn!(
                    queue = %self.queue_url,
                    message_id = %message.message_id,
                    error = %e,
                    "Failed to delete deferral, it may be delivered again"
                );
            }
            taken.push(deferral);
        }
        taken
    }
}

#[async_trait]
impl DeferralService for QueueDeferralService {
    async fn defer(&self, project_key: &str, branch: &str, build_id: &str) -> Result<()> {
        if project_key.is_empty() || branch.is_empty() || build_id.is_empty() {
            return Err(Error::InvalidInput(format!(
                "deferral needs project key, branch and build id (got '{}', '{}', '{}')",
                project_key, branch, build_id
            )));
        }

        let _guard = self.guard.lock().await;
        let deferral = Deferral::new(project_key, branch, build_id, self.clock.now_unix());
        let message = deferral.to_message(self.initial_delay);

        self.retry
            .run(|| self.transport.send(&self.queue_url, message.clone()))
            .await?;

        info!(
            key = %deferral.key(),
            build_id = %deferral.build_id,
            unix_time = deferral.unix_time,
            "Deferred build"
        );
        Ok(())
    }

    async fn resubmit(&self) -> Result<usize> {
        let deferrals = {
            let _guard = self.guard.lock().await;
            let request = ReceiveRequest::batch(self.batch_size);
            let messages = self
                .retry
                .run(|| self.transport.receive(&self.queue_url, request))
                .await?;
            if messages.is_empty() {
                debug!(queue = %self.queue_url, "No deferred builds");
                return Ok(0);
            }
            self.take_batch(messages).await
        };

        let received = deferrals.len();
        let ordered = sort_and_dedup(deferrals);
        debug!(
            received,
            relaying = ordered.len(),
            "Resubmitting deferred builds"
        );

        let _relaying = self.relay_guard.lock().await;
        let mut relayed = 0;
        for deferral in ordered {
            let key = deferral.key();
            if self.relay.send(deferral).await.is_err() {
                warn!(key = %key, relayed, "Relay closed during resubmit");
                return Err(Error::RelayClosed);
            }
            relayed += 1;
        }

        if relayed > 0 {
            info!(relayed, "Resubmitted deferred builds");
        }
        Ok(relayed)
    }

    async fn deferred_builds(&self) -> Result<Vec<Deferral>> {
        let _guard = self.guard.lock().await;
        let depth = self
            .retry
            .run(|| self.transport.approximate_message_count(&self.queue_url))
            .await?;
        let pages = depth.div_ceil(MAX_RECEIVE_BATCH);

        let mut seen = HashSet::new();
        let mut deferrals = Vec::with_capacity(depth);
        for page in 0..pages {
            let request = ReceiveRequest::peek(MAX_RECEIVE_BATCH);
            let messages = match self
                .retry
                .run(|| self.transport.receive(&self.queue_url, request))
                .await
            {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(queue = %self.queue_url, page, error = %e, "Failed to read deferral page");
                    continue;
                }
            };

            for message in messages {
                if !seen.insert(message.message_id.clone()) {
                    continue;
                }
                match Deferral::from_message(&message) {
                    Ok(deferral) => deferrals.push(deferral),
                    Err(e) => warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "Skipping malformed deferral"
                    ),
                }
            }
        }

        Ok(sort_and_dedup(deferrals))
    }
}
