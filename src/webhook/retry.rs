//! # Retry Scheduler
//!
//! Background task that drains the webhook retry queue. Each tick it loads
//! every item whose `next_retry_at` has passed and hands it to the
//! dispatcher, one at a time.
//!
//! Exactly one scheduler runs per deployment. Items within a tick are
//! processed sequentially, and an item is deleted from the queue before its
//! attempt runs, so a single delivery can never have two in-flight retries.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let scheduler = RetryScheduler::new(store, dispatcher, config);
//! let handle = scheduler.spawn();
//!
//! // ... on shutdown:
//! handle.shutdown().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::config::DefenseConfig;
use crate::storage::DefenseStore;
use crate::webhook::dispatcher::WebhookDispatcher;

/// The retry scheduler.
#[derive(Clone)]
pub struct RetryScheduler {
    /// Storage handle for the retry queue.
    store: Arc<dyn DefenseStore>,

    /// Dispatcher that performs the actual attempts.
    dispatcher: WebhookDispatcher,

    /// Subsystem configuration.
    config: DefenseConfig,
}

/// Handle for a running scheduler. Dropping it does not stop the task;
/// call [`shutdown`](Self::shutdown) for an orderly stop.
pub struct RetrySchedulerHandle {
    stop: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl RetrySchedulerHandle {
    /// Signal the scheduler to stop and wait for the current tick to
    /// finish.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            error!("Retry scheduler task failed to join: {}", e);
        }
    }
}

impl RetryScheduler {
    /// Create a new scheduler.
    pub fn new(
        store: Arc<dyn DefenseStore>,
        dispatcher: WebhookDispatcher,
        config: DefenseConfig,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Spawn the polling loop onto the runtime.
    pub fn spawn(self) -> RetrySchedulerHandle {
        let (stop, mut stopped) = watch::channel(false);
        let task = tokio::spawn(async move {
            info!(
                "Starting webhook retry scheduler (poll interval: {}s)",
                self.config.retry_poll_interval_secs
            );
            let mut ticker = interval(Duration::from_secs(self.config.retry_poll_interval_secs));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick_once().await {
                            error!("Retry sweep failed: {}", e);
                        }
                    }
                    _ = stopped.changed() => {
                        info!("Webhook retry scheduler stopping");
                        break;
                    }
                }
            }
        });
        RetrySchedulerHandle { stop, task }
    }

    /// One sweep of the queue: load everything due, process sequentially.
    ///
    /// Public so tests (and batch tooling) can drive the queue
    /// deterministically without the timer.
    pub async fn tick_once(&self) -> Result<(), crate::webhook::DeliveryError> {
        let ready = self.store.get_ready_webhook_retries().await?;
        if ready.is_empty() {
            return Ok(());
        }
        debug!("Processing {} ready webhook retries", ready.len());

        for item in ready {
            let delivery_id = item.delivery_id;
            // One bad item must not stall the rest of the sweep.
            if let Err(e) = self.dispatcher.process_retry(item).await {
                error!("Retry for delivery {} failed: {}", delivery_id, e);
            }
        }
        Ok(())
    }
}
