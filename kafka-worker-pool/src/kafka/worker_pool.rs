//! Worker Pool - Parallel processing for one partition assignment
//!
//! Every `start` creates a new generation: an offset tracker and committer
//! scoped to exactly the assigned partitions, `worker_count` workers and a
//! freshly built distribution strategy. `stop` tears the generation down in
//! order: workers first (in-flight records finish), then the committer's
//! final flush.
//!
//! `enqueue` registers the record's offset with the tracker before anything
//! else so the watermark can never pass a record that is still on its way to
//! a worker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::ConsumerError;
use crate::kafka::client::BrokerClient;
use crate::kafka::distribution::{DistributionStrategy, DistributionStrategyFactory, Worker};
use crate::kafka::handler::MessageHandler;
use crate::kafka::metrics_consts::{ASSIGNED_PARTITIONS, POOL_STARTS, POOL_STOPS, RECORDS_DROPPED};
use crate::kafka::offset_committer::OffsetCommitter;
use crate::kafka::offset_tracker::{OffsetStore, OffsetTracker};
use crate::kafka::types::{KafkaRecord, Partition};
use crate::kafka::worker::{ConsumerWorker, WorkerSettings};

/// Lifecycle seam between the manager/feeder and the pool
#[async_trait]
pub trait WorkerPool: Send + Sync {
    /// Start a generation for these partitions, stopping any running one first
    async fn start(&self, partitions: Vec<Partition>);

    /// Stop the running generation, if any, and flush its offsets
    async fn stop(&self);

    /// Hand a record to a worker. Waits for strategy selection and for room in
    /// the worker's queue; both waits end when `cancel` fires or the pool stops.
    async fn enqueue(
        &self,
        record: KafkaRecord,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError>;

    fn is_running(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct WorkerPoolSettings {
    pub consumer_name: Arc<str>,
    pub group_id: Arc<str>,
    pub worker_count: usize,
    pub buffer_size: usize,
    pub auto_store_offsets: bool,
    pub commit_interval: Duration,
}

impl WorkerPoolSettings {
    fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            consumer_name: self.consumer_name.clone(),
            group_id: self.group_id.clone(),
            buffer_size: self.buffer_size,
            auto_store_offsets: self.auto_store_offsets,
        }
    }
}

/// Everything owned by one assignment
struct Generation {
    partitions: Vec<Partition>,
    workers: Vec<Arc<ConsumerWorker>>,
    strategy: Box<dyn DistributionStrategy>,
    tracker: Arc<OffsetTracker>,
    committer: Arc<OffsetCommitter>,
    stopping: CancellationToken,
}

pub struct ConsumerWorkerPool {
    client: Arc<dyn BrokerClient>,
    handler: Arc<dyn MessageHandler>,
    settings: WorkerPoolSettings,
    strategy_factory: DistributionStrategyFactory,
    generation: Mutex<Option<Arc<Generation>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ConsumerWorkerPool {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        handler: Arc<dyn MessageHandler>,
        settings: WorkerPoolSettings,
        strategy_factory: DistributionStrategyFactory,
    ) -> Self {
        Self {
            client,
            handler,
            settings,
            strategy_factory,
            generation: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &WorkerPoolSettings {
        &self.settings
    }

    /// Partitions owned by the running generation
    pub fn partitions(&self) -> Vec<Partition> {
        self.generation
            .lock()
            .as_ref()
            .map(|generation| generation.partitions.clone())
            .unwrap_or_default()
    }

    /// Watermark of a partition in the running generation
    pub fn last_offset(&self, partition: &Partition) -> Option<i64> {
        let generation = self.generation.lock().clone()?;
        generation.tracker.last_offset(partition)
    }

    fn build_generation(&self, partitions: Vec<Partition>) -> Generation {
        let committer = OffsetCommitter::start(self.client.clone(), self.settings.commit_interval);
        let store: Arc<dyn OffsetStore> = committer.clone();
        let tracker = Arc::new(OffsetTracker::new(store, partitions.iter().cloned()));

        let worker_settings = self.settings.worker_settings();
        let workers: Vec<Arc<ConsumerWorker>> = (0..self.settings.worker_count)
            .map(|id| {
                ConsumerWorker::start(id, self.handler.clone(), tracker.clone(), &worker_settings)
            })
            .collect();

        let erased: Vec<Arc<dyn Worker>> = workers
            .iter()
            .map(|worker| {
                let worker: Arc<dyn Worker> = worker.clone();
                worker
            })
            .collect();
        let mut strategy = (self.strategy_factory)();
        strategy.initialize(&erased);

        Generation {
            partitions,
            workers,
            strategy,
            tracker,
            committer,
            stopping: CancellationToken::new(),
        }
    }

    async fn stop_generation(&self, generation: Arc<Generation>) {
        generation.stopping.cancel();

        join_all(generation.workers.iter().map(|worker| worker.stop())).await;
        generation.committer.shutdown().await;

        metrics::counter!(POOL_STOPS).increment(1);
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);
        info!(
            consumer = %self.settings.consumer_name,
            partitions = generation.partitions.len(),
            "Worker pool stopped"
        );
    }

    fn drop_record(&self, record: &KafkaRecord, reason: &'static str) {
        metrics::counter!(RECORDS_DROPPED, "reason" => reason).increment(1);
        debug!(
            topic = record.topic(),
            partition = record.partition_number(),
            offset = record.offset(),
            reason = reason,
            "Dropping record"
        );
    }
}

#[async_trait]
impl WorkerPool for ConsumerWorkerPool {
    async fn start(&self, partitions: Vec<Partition>) {
        let _lifecycle = self.lifecycle.lock().await;

        let previous = self.generation.lock().take();
        if let Some(previous) = previous {
            warn!(
                consumer = %self.settings.consumer_name,
                "Worker pool started while running, stopping previous generation"
            );
            self.stop_generation(previous).await;
        }

        let generation = self.build_generation(partitions);
        info!(
            consumer = %self.settings.consumer_name,
            workers = generation.workers.len(),
            partitions = ?generation.partitions,
            "Worker pool started"
        );
        metrics::counter!(POOL_STARTS).increment(1);
        metrics::gauge!(ASSIGNED_PARTITIONS).set(generation.partitions.len() as f64);

        *self.generation.lock() = Some(Arc::new(generation));
    }

    async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;

        let generation = self.generation.lock().take();
        if let Some(generation) = generation {
            self.stop_generation(generation).await;
        }
    }

    async fn enqueue(
        &self,
        record: KafkaRecord,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        let Some(generation) = self.generation.lock().clone() else {
            warn!(
                topic = record.topic(),
                partition = record.partition_number(),
                offset = record.offset(),
                "Worker pool is not running, dropping record"
            );
            metrics::counter!(RECORDS_DROPPED, "reason" => "not_running").increment(1);
            return Ok(());
        };

        if !generation.tracker.contains(record.partition()) {
            warn!(
                topic = record.topic(),
                partition = record.partition_number(),
                offset = record.offset(),
                "Record from a partition outside the current assignment, dropping"
            );
            metrics::counter!(RECORDS_DROPPED, "reason" => "unassigned").increment(1);
            return Ok(());
        }

        generation
            .tracker
            .add_offset(record.partition(), record.offset());

        let selected = tokio::select! {
            biased;
            _ = generation.stopping.cancelled() => None,
            selected = generation.strategy.get_worker(record.key(), cancel) => selected,
        };

        let Some(worker) = selected.and_then(|index| generation.workers.get(index)) else {
            if cancel.is_cancelled() {
                return Err(ConsumerError::Cancelled);
            }
            self.drop_record(&record, "stopping");
            return Ok(());
        };

        debug!(
            topic = record.topic(),
            partition = record.partition_number(),
            offset = record.offset(),
            worker_id = worker.id(),
            "Dispatching record"
        );

        let (topic, partition, offset) = (
            record.topic().to_string(),
            record.partition_number(),
            record.offset(),
        );
        let result = tokio::select! {
            biased;
            _ = generation.stopping.cancelled() => Err(ConsumerError::WorkerStopped(worker.id())),
            result = worker.enqueue(record, cancel) => result,
        };

        match result {
            Ok(()) => Ok(()),
            Err(ConsumerError::WorkerStopped(worker_id)) => {
                metrics::counter!(RECORDS_DROPPED, "reason" => "stopping").increment(1);
                debug!(
                    topic = topic,
                    partition = partition,
                    offset = offset,
                    worker_id = worker_id,
                    "Worker stopped before the record was queued, dropping"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn is_running(&self) -> bool {
        self.generation.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::kafka::distribution::DistributionStrategyKind;
    use crate::kafka::test_utils::{record, shared_client, RecordingHandler, ScriptedBrokerClient};

    fn settings(worker_count: usize, buffer_size: usize) -> WorkerPoolSettings {
        WorkerPoolSettings {
            consumer_name: Arc::from("test-consumer"),
            group_id: Arc::from("test-group"),
            worker_count,
            buffer_size,
            auto_store_offsets: true,
            commit_interval: Duration::from_secs(3600),
        }
    }

    fn pool(
        client: &Arc<ScriptedBrokerClient>,
        handler: &Arc<RecordingHandler>,
        settings: WorkerPoolSettings,
        kind: DistributionStrategyKind,
    ) -> ConsumerWorkerPool {
        ConsumerWorkerPool::new(shared_client(client), handler.clone(), settings, kind.factory())
    }

    #[tokio::test]
    async fn test_enqueue_without_generation_drops_record() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new());
        let pool = pool(&client, &handler, settings(2, 10), DistributionStrategyKind::KeyHash);

        let result = pool.enqueue(record("events", 0, 0, None), &CancellationToken::new()).await;

        assert!(result.is_ok());
        assert!(!pool.is_running());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handler.count(), 0);
    }

    #[tokio::test]
    async fn test_same_key_goes_to_one_worker_in_order() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new());
        let pool = pool(&client, &handler, settings(10, 10), DistributionStrategyKind::KeyHash);
        let cancel = CancellationToken::new();

        pool.start(vec![Partition::new("events", 0)]).await;
        for offset in 0..10 {
            pool.enqueue(record("events", 0, offset, Some("user-1")), &cancel).await.unwrap();
        }

        assert!(handler.wait_for(10, Duration::from_secs(5)).await);
        pool.stop().await;

        let by_worker = handler.offsets_by_worker();
        assert_eq!(by_worker.len(), 1);
        let offsets = by_worker.values().next().unwrap();
        assert_eq!(offsets, &(0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn test_stop_flushes_committed_offsets() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new());
        let pool = pool(&client, &handler, settings(4, 10), DistributionStrategyKind::FreeWorker);
        let cancel = CancellationToken::new();
        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);

        pool.start(vec![p0.clone(), p1.clone()]).await;
        for offset in 0..5 {
            pool.enqueue(record("events", 0, offset, None), &cancel).await.unwrap();
            pool.enqueue(record("events", 1, offset + 100, None), &cancel).await.unwrap();
        }

        assert!(handler.wait_for(10, Duration::from_secs(5)).await);
        pool.stop().await;

        assert!(!pool.is_running());
        assert_eq!(client.committed(&p0), Some(5));
        assert_eq!(client.committed(&p1), Some(105));
    }

    #[tokio::test]
    async fn test_restart_replaces_generation() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new());
        let pool = pool(&client, &handler, settings(2, 10), DistributionStrategyKind::KeyHash);
        let cancel = CancellationToken::new();
        let p0 = Partition::new("events", 0);
        let p1 = Partition::new("events", 1);

        pool.start(vec![p0.clone()]).await;
        pool.enqueue(record("events", 0, 7, None), &cancel).await.unwrap();
        assert!(handler.wait_for(1, Duration::from_secs(5)).await);

        pool.start(vec![p1.clone()]).await;

        assert_eq!(client.committed(&p0), Some(8));
        assert_eq!(pool.partitions(), vec![p1]);

        // Records for partitions no longer owned are not processed
        pool.enqueue(record("events", 0, 8, None), &cancel).await.unwrap();
        pool.stop().await;
        assert_eq!(handler.count(), 1);
    }

    #[tokio::test]
    async fn test_stop_releases_blocked_enqueue() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(300)));
        let pool = Arc::new(pool(&client, &handler, settings(1, 1), DistributionStrategyKind::KeyHash));
        let cancel = CancellationToken::new();
        let p0 = Partition::new("events", 0);

        pool.start(vec![p0.clone()]).await;
        pool.enqueue(record("events", 0, 0, None), &cancel).await.unwrap();
        pool.enqueue(record("events", 0, 1, None), &cancel).await.unwrap();

        let blocked = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.enqueue(record("events", 0, 2, None), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        pool.stop().await;

        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked enqueue should be released by stop")
            .unwrap();
        assert!(result.is_ok());
        // Only the in-flight record completed; the gap at 1 holds the watermark
        assert_eq!(client.committed(&p0), Some(1));
    }

    #[tokio::test]
    async fn test_enqueue_cancelled_by_caller() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_secs(1)));
        let pool = pool(&client, &handler, settings(1, 1), DistributionStrategyKind::FreeWorker);
        let cancel = CancellationToken::new();

        pool.start(vec![Partition::new("events", 0)]).await;
        pool.enqueue(record("events", 0, 0, None), &cancel).await.unwrap();

        cancel.cancel();
        let result = pool.enqueue(record("events", 0, 1, None), &cancel).await;

        assert!(matches!(result, Err(ConsumerError::Cancelled)));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_free_worker_spreads_load() {
        let client = Arc::new(ScriptedBrokerClient::new(vec!["events"]));
        let handler = Arc::new(RecordingHandler::new().with_delay(Duration::from_millis(100)));
        let pool = pool(&client, &handler, settings(4, 1), DistributionStrategyKind::FreeWorker);
        let cancel = CancellationToken::new();

        pool.start(vec![Partition::new("events", 0)]).await;
        for offset in 0..4 {
            pool.enqueue(record("events", 0, offset, Some("same-key")), &cancel).await.unwrap();
        }

        assert!(handler.wait_for(4, Duration::from_secs(5)).await);
        pool.stop().await;

        let workers: HashSet<usize> = handler.processed().iter().map(|r| r.worker_id).collect();
        assert_eq!(workers.len(), 4);
        assert_eq!(client.committed(&Partition::new("events", 0)), Some(4));
    }
}
