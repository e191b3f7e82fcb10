use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::kafka::client::BrokerClient;
use crate::kafka::metrics_consts::FETCH_ERRORS;
use crate::kafka::worker_pool::WorkerPool;

/// Single fetch-then-dispatch loop feeding a worker pool.
///
/// Fetch and enqueue errors are logged and the loop goes straight back to
/// fetching. Cancellation ends the loop from inside either wait.
pub struct WorkerPoolFeeder {
    client: Arc<dyn BrokerClient>,
    pool: Arc<dyn WorkerPool>,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl WorkerPoolFeeder {
    pub fn new(client: Arc<dyn BrokerClient>, pool: Arc<dyn WorkerPool>) -> Self {
        Self {
            client,
            pool,
            running: Mutex::new(None),
        }
    }

    /// Spawn the feed loop. A second call while running is ignored.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.is_some() {
            warn!("Feeder already running");
            return;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(Self::run(
            self.client.clone(),
            self.pool.clone(),
            cancel.clone(),
        ));
        *running = Some((cancel, task));
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Cancel the loop and wait for it to exit. Returns immediately if not started.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some((cancel, task)) = running else {
            return;
        };

        cancel.cancel();
        if let Err(e) = task.await {
            warn!(error = %e, "Feeder task ended abnormally");
        }
    }

    async fn run(
        client: Arc<dyn BrokerClient>,
        pool: Arc<dyn WorkerPool>,
        cancel: CancellationToken,
    ) {
        info!("Feeder started");

        while !cancel.is_cancelled() {
            let record = match client.fetch_next(&cancel).await {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch record");
                    metrics::counter!(FETCH_ERRORS).increment(1);
                    continue;
                }
            };

            match pool.enqueue(record, &cancel).await {
                Ok(()) => {}
                Err(ConsumerError::Cancelled) => break,
                Err(e) => warn!(error = %e, "Failed to enqueue record"),
            }
        }

        debug!("Feeder loop exited");
    }
}
