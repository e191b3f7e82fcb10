//! Consumer Manager - Lifecycle of one consumer
//!
//! Ties a broker client, a worker pool and a feeder together and keeps the
//! pool in step with the group assignment:
//!
//! - **assigned**: a new pool generation is started for exactly the assigned
//!   partitions before the client returns to fetching.
//! - **revoked**: the pool is stopped (workers drained, final commit done)
//!   before the revocation callback returns, so no other member can start on
//!   these partitions while offsets are still pending here.
//!
//! librdkafka invokes rebalance callbacks synchronously, from inside the
//! feeder's fetch. The manager bridges them to the async pool with
//! `block_in_place` + `Handle::block_on`, which needs the multi-threaded Tokio
//! runtime.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{error, info};
use uuid::Uuid;

use crate::error::{ConfigError, ConsumerError};
use crate::kafka::client::{
    BrokerClient, ErrorHandler, PartitionsAssignedHandler, PartitionsRevokedHandler,
    StatisticsHandler,
};
use crate::kafka::distribution::{DistributionStrategyFactory, DistributionStrategyKind};
use crate::kafka::feeder::WorkerPoolFeeder;
use crate::kafka::handler::MessageHandler;
use crate::kafka::types::{ConsumerState, Partition, PartitionOffset};
use crate::kafka::worker_pool::{ConsumerWorkerPool, WorkerPool, WorkerPoolSettings};

/// Delay between stopping and starting again in [`ConsumerManager::restart`]
pub const RESTART_DELAY: Duration = Duration::from_secs(5);

pub const MAX_WORKER_COUNT: usize = 255;

pub fn default_consumer_name() -> String {
    format!("Consumer_{}", Uuid::new_v4().simple())
}

/// What a consumer is and how it processes records
#[derive(Clone)]
pub struct ConsumerSettings {
    pub topics: Vec<String>,
    pub group_id: String,
    pub consumer_name: String,
    pub worker_count: usize,
    pub buffer_size: usize,
    pub auto_store_offsets: bool,
    pub auto_commit_interval: Duration,
    pub strategy_factory: DistributionStrategyFactory,
}

impl ConsumerSettings {
    pub fn new(group_id: impl Into<String>, topics: Vec<String>) -> Self {
        Self {
            topics,
            group_id: group_id.into(),
            consumer_name: default_consumer_name(),
            worker_count: 1,
            buffer_size: 1,
            auto_store_offsets: true,
            auto_commit_interval: Duration::from_secs(5),
            strategy_factory: DistributionStrategyKind::KeyHash.factory(),
        }
    }

    pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
        self.consumer_name = name.into();
        self
    }

    pub fn with_workers(mut self, worker_count: usize, buffer_size: usize) -> Self {
        self.worker_count = worker_count;
        self.buffer_size = buffer_size;
        self
    }

    pub fn with_auto_store_offsets(mut self, enabled: bool) -> Self {
        self.auto_store_offsets = enabled;
        self
    }

    pub fn with_auto_commit_interval(mut self, interval: Duration) -> Self {
        self.auto_commit_interval = interval;
        self
    }

    pub fn with_strategy(mut self, kind: DistributionStrategyKind) -> Self {
        self.strategy_factory = kind.factory();
        self
    }

    pub fn with_strategy_factory(mut self, factory: DistributionStrategyFactory) -> Self {
        self.strategy_factory = factory;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=MAX_WORKER_COUNT).contains(&self.worker_count) {
            return Err(ConfigError::WorkerCount(self.worker_count));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::BufferSize);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::MissingGroupId);
        }
        if self.topics.iter().all(|topic| topic.trim().is_empty()) {
            return Err(ConfigError::MissingTopics);
        }
        Ok(())
    }

    pub fn pool_settings(&self) -> WorkerPoolSettings {
        WorkerPoolSettings {
            consumer_name: Arc::from(self.consumer_name.as_str()),
            group_id: Arc::from(self.group_id.as_str()),
            worker_count: self.worker_count,
            buffer_size: self.buffer_size,
            auto_store_offsets: self.auto_store_offsets,
            commit_interval: self.auto_commit_interval,
        }
    }
}

impl fmt::Debug for ConsumerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerSettings")
            .field("topics", &self.topics)
            .field("group_id", &self.group_id)
            .field("consumer_name", &self.consumer_name)
            .field("worker_count", &self.worker_count)
            .field("buffer_size", &self.buffer_size)
            .field("auto_store_offsets", &self.auto_store_offsets)
            .field("auto_commit_interval", &self.auto_commit_interval)
            .finish_non_exhaustive()
    }
}

pub struct ConsumerManager {
    client: Arc<dyn BrokerClient>,
    pool: Arc<dyn WorkerPool>,
    feeder: WorkerPoolFeeder,
    settings: ConsumerSettings,
    state: Mutex<ConsumerState>,
    restart_delay: Duration,
}

impl ConsumerManager {
    pub fn new(
        client: Arc<dyn BrokerClient>,
        handler: Arc<dyn MessageHandler>,
        settings: ConsumerSettings,
    ) -> Result<Self, ConfigError> {
        settings.validate()?;

        let pool: Arc<dyn WorkerPool> = Arc::new(ConsumerWorkerPool::new(
            client.clone(),
            handler,
            settings.pool_settings(),
            settings.strategy_factory.clone(),
        ));

        Ok(Self::with_pool(client, pool, settings))
    }

    /// Build around an existing pool; registers the rebalance handlers on `client`
    pub fn with_pool(
        client: Arc<dyn BrokerClient>,
        pool: Arc<dyn WorkerPool>,
        settings: ConsumerSettings,
    ) -> Self {
        let runtime = Handle::try_current().ok();

        // Weak so the client's handler list does not keep the pool alive
        {
            let pool = Arc::downgrade(&pool);
            let runtime = runtime.clone();
            let consumer = settings.consumer_name.clone();
            let group = settings.group_id.clone();
            client.on_partitions_assigned(Arc::new(move |partitions: &[Partition]| {
                info!(
                    consumer = %consumer,
                    group = %group,
                    partitions = ?partitions,
                    "Partitions assigned"
                );
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                let partitions = partitions.to_vec();
                run_blocking(runtime.as_ref(), async move { pool.start(partitions).await });
            }));
        }

        {
            let pool = Arc::downgrade(&pool);
            let consumer = settings.consumer_name.clone();
            let group = settings.group_id.clone();
            client.on_partitions_revoked(Arc::new(move |partitions: &[PartitionOffset]| {
                let revoked: Vec<&Partition> =
                    partitions.iter().map(PartitionOffset::partition).collect();
                info!(
                    consumer = %consumer,
                    group = %group,
                    partitions = ?revoked,
                    "Partitions revoked"
                );
                let Some(pool) = pool.upgrade() else {
                    return;
                };
                run_blocking(runtime.as_ref(), async move { pool.stop().await });
            }));
        }

        let feeder = WorkerPoolFeeder::new(client.clone(), pool.clone());

        Self {
            client,
            pool,
            feeder,
            settings,
            state: Mutex::new(ConsumerState::Idle),
            restart_delay: RESTART_DELAY,
        }
    }

    pub fn with_restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    /// Start fetching. The broker connection is made on the first fetch.
    ///
    /// Rebalance handlers block on pool work from inside the fetch, so this
    /// refuses to start outside a multi-threaded Tokio runtime.
    pub fn start(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock();
        if *state != ConsumerState::Idle {
            return Err(ConsumerError::InvalidState(*state, ConsumerState::Idle));
        }

        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {}
            _ => {
                error!(
                    consumer = %self.settings.consumer_name,
                    "Consumer requires the multi-threaded Tokio runtime"
                );
                return Err(ConsumerError::UnsupportedRuntime);
            }
        }

        self.feeder.start();
        *state = ConsumerState::Running;
        info!(
            consumer = %self.settings.consumer_name,
            group = %self.settings.group_id,
            topics = ?self.settings.topics,
            workers = self.settings.worker_count,
            "Consumer started"
        );
        Ok(())
    }

    /// Stop fetching, drain the pool and leave the group
    pub async fn stop(&self) -> Result<(), ConsumerError> {
        self.begin_stopping()?;

        self.feeder.stop().await;
        self.pool.stop().await;
        self.client.close();

        *self.state.lock() = ConsumerState::Idle;
        info!(consumer = %self.settings.consumer_name, "Consumer stopped");
        Ok(())
    }

    /// Stop, wait the restart delay, start again
    pub async fn restart(&self) -> Result<(), ConsumerError> {
        self.stop().await?;
        tokio::time::sleep(self.restart_delay).await;
        self.start()
    }

    /// Commit `offsets` in place of whatever the consumer reached, then restart
    /// so consumption resumes from them.
    pub async fn override_offsets_and_restart(
        &self,
        offsets: Vec<PartitionOffset>,
    ) -> Result<(), ConsumerError> {
        if offsets.is_empty() {
            return Err(ConsumerError::EmptyOffsets);
        }
        self.begin_stopping()?;

        self.feeder.stop().await;
        self.pool.stop().await;

        let committed = self.client.commit(&offsets);
        match &committed {
            Ok(()) => info!(
                consumer = %self.settings.consumer_name,
                offsets = ?offsets,
                "Committed override offsets"
            ),
            Err(e) => error!(
                consumer = %self.settings.consumer_name,
                error = %e,
                "Failed to commit override offsets"
            ),
        }

        self.client.close();
        *self.state.lock() = ConsumerState::Idle;

        tokio::time::sleep(self.restart_delay).await;
        self.start()?;
        committed
    }

    fn begin_stopping(&self) -> Result<(), ConsumerError> {
        let mut state = self.state.lock();
        if *state != ConsumerState::Running {
            return Err(ConsumerError::InvalidState(*state, ConsumerState::Running));
        }
        *state = ConsumerState::Stopping;
        Ok(())
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.lock()
    }

    pub fn consumer_name(&self) -> &str {
        &self.settings.consumer_name
    }

    pub fn group_id(&self) -> &str {
        &self.settings.group_id
    }

    pub fn worker_count(&self) -> usize {
        self.settings.worker_count
    }

    pub fn subscription(&self) -> Vec<String> {
        self.client.subscription()
    }

    pub fn assignment(&self) -> Vec<Partition> {
        self.client.assignment()
    }

    pub fn client_instance_name(&self) -> Option<String> {
        self.client.client_instance_name()
    }

    pub fn member_id(&self) -> Option<String> {
        self.client.member_id()
    }

    pub fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        self.client.position(partition)
    }

    pub fn on_partitions_assigned(&self, handler: PartitionsAssignedHandler) {
        self.client.on_partitions_assigned(handler);
    }

    pub fn on_partitions_revoked(&self, handler: PartitionsRevokedHandler) {
        self.client.on_partitions_revoked(handler);
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.client.on_error(handler);
    }

    pub fn on_statistics(&self, handler: StatisticsHandler) {
        self.client.on_statistics(handler);
    }
}

/// Drive `future` to completion from a synchronous broker callback
fn run_blocking<F: Future>(fallback: Option<&Handle>, future: F) {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(|| handle.block_on(future));
        }
        Ok(_) => {
            error!("Rebalance handling requires the multi-threaded Tokio runtime");
        }
        Err(_) => match fallback {
            Some(handle) => {
                handle.block_on(future);
            }
            None => error!("No Tokio runtime available to handle rebalance"),
        },
    }
}
