use std::collections::HashMap;
use std::mem;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::kafka::client::BrokerClient;
use crate::kafka::metrics_consts::{COMMITS, COMMIT_FAILURES, PARTITION_LAST_COMMITTED_OFFSET};
use crate::kafka::offset_tracker::OffsetStore;
use crate::kafka::types::{Partition, PartitionOffset};

/// Batches staged offsets and commits them on a fixed interval.
///
/// Staging is last-writer-wins per partition. Each tick swaps the staging map
/// for an empty one and commits the batch in a single call. A failed batch is
/// merged back, keeping any newer offset staged in the meantime, so the next
/// tick retries a superset. [`shutdown`](Self::shutdown) stops the timer and
/// flushes once more.
pub struct OffsetCommitter {
    client: Arc<dyn BrokerClient>,
    staged: Mutex<HashMap<Partition, i64>>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl OffsetCommitter {
    /// Committer without a timer; offsets are only committed by explicit flushes
    pub fn new(client: Arc<dyn BrokerClient>) -> Self {
        Self {
            client,
            staged: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    /// Create a committer and spawn its commit task on the current runtime
    pub fn start(client: Arc<dyn BrokerClient>, interval: Duration) -> Arc<Self> {
        let committer = Arc::new(Self::new(client));
        let task = tokio::spawn(Self::run(
            Arc::downgrade(&committer),
            committer.shutdown.clone(),
            interval,
        ));
        *committer.task.lock() = Some(task);
        committer
    }

    async fn run(committer: Weak<Self>, shutdown: CancellationToken, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(committer) = committer.upgrade() else {
                        break;
                    };
                    committer.commit_staged();
                }
            }
        }

        debug!("Offset commit task stopped");
    }

    /// Stage the next offset to consume for a partition
    pub fn stage(&self, partition: Partition, offset: i64) {
        self.staged.lock().insert(partition, offset);
    }

    pub fn staged_offset(&self, partition: &Partition) -> Option<i64> {
        self.staged.lock().get(partition).copied()
    }

    pub fn has_staged(&self) -> bool {
        !self.staged.lock().is_empty()
    }

    /// Commit everything staged so far. Returns false if the commit failed and
    /// the batch was put back.
    pub fn commit_staged(&self) -> bool {
        let batch = mem::take(&mut *self.staged.lock());
        if batch.is_empty() {
            return true;
        }

        let offsets: Vec<PartitionOffset> = batch
            .iter()
            .map(|(partition, offset)| PartitionOffset::new(partition.clone(), *offset))
            .collect();

        match self.client.commit(&offsets) {
            Ok(()) => {
                metrics::counter!(COMMITS).increment(1);
                for offset in &offsets {
                    metrics::gauge!(
                        PARTITION_LAST_COMMITTED_OFFSET,
                        "topic" => offset.topic().to_string(),
                        "partition" => offset.partition_number().to_string()
                    )
                    .set(offset.offset() as f64);
                }
                debug!(partitions = offsets.len(), "Committed offsets");
                true
            }
            Err(e) => {
                error!(
                    error = %e,
                    partitions = offsets.len(),
                    "Failed to commit offsets, will retry on next tick"
                );
                metrics::counter!(COMMIT_FAILURES).increment(1);

                let mut staged = self.staged.lock();
                for (partition, offset) in batch {
                    staged.entry(partition).or_insert(offset);
                }
                false
            }
        }
    }

    /// Stop the commit task and flush whatever is still staged
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Offset commit task ended abnormally");
            }
        }

        if !self.commit_staged() {
            warn!("Final offset flush failed, uncommitted records will be redelivered");
        } else {
            info!("Offset committer shut down");
        }
    }
}

impl OffsetStore for OffsetCommitter {
    fn store_offset(&self, offset: PartitionOffset) {
        self.stage(offset.partition().clone(), offset.offset());
    }
}
