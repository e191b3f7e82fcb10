use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{is_fatal_error, ConsumerError};
use crate::kafka::lazy_client::LazyClient;
use crate::kafka::metrics_consts::{CONSUMER_RECREATED, RECORDS_FETCHED};
use crate::kafka::types::{KafkaRecord, Partition, PartitionOffset};

/// Delay before a consumer is rebuilt after a fatal error
pub const FATAL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

pub type PartitionsAssignedHandler = Arc<dyn Fn(&[Partition]) + Send + Sync>;
pub type PartitionsRevokedHandler = Arc<dyn Fn(&[PartitionOffset]) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&KafkaError) + Send + Sync>;
pub type StatisticsHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Ordered handler lists fired by a broker client.
///
/// Handlers run synchronously in registration order on whatever thread the
/// client raises the event from. The lists are snapshotted before invoking,
/// so a handler may register further handlers without deadlocking.
#[derive(Default)]
pub struct ClientCallbacks {
    assigned: RwLock<Vec<PartitionsAssignedHandler>>,
    revoked: RwLock<Vec<PartitionsRevokedHandler>>,
    errors: RwLock<Vec<ErrorHandler>>,
    statistics: RwLock<Vec<StatisticsHandler>>,
}

impl ClientCallbacks {
    pub fn add_partitions_assigned(&self, handler: PartitionsAssignedHandler) {
        self.assigned.write().push(handler);
    }

    pub fn add_partitions_revoked(&self, handler: PartitionsRevokedHandler) {
        self.revoked.write().push(handler);
    }

    pub fn add_error(&self, handler: ErrorHandler) {
        self.errors.write().push(handler);
    }

    pub fn add_statistics(&self, handler: StatisticsHandler) {
        self.statistics.write().push(handler);
    }

    pub fn notify_partitions_assigned(&self, partitions: &[Partition]) {
        let handlers = self.assigned.read().clone();
        for handler in handlers {
            handler(partitions);
        }
    }

    pub fn notify_partitions_revoked(&self, partitions: &[PartitionOffset]) {
        let handlers = self.revoked.read().clone();
        for handler in handlers {
            handler(partitions);
        }
    }

    pub fn notify_error(&self, error: &KafkaError) {
        let handlers = self.errors.read().clone();
        for handler in handlers {
            handler(error);
        }
    }

    pub fn notify_statistics(&self, statistics: &str) {
        let handlers = self.statistics.read().clone();
        for handler in handlers {
            handler(statistics);
        }
    }

    pub fn has_statistics_handlers(&self) -> bool {
        !self.statistics.read().is_empty()
    }
}

/// The broker-facing half of a consumer.
///
/// Implementations must be safe to use from several tasks at once: the feeder
/// fetches while the commit task commits.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Next record, suspending until one is available. `Ok(None)` once `cancel` fires.
    async fn fetch_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<KafkaRecord>, ConsumerError>;

    /// Synchronously commit next-to-consume offsets
    fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError>;

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError>;

    /// Low and high watermarks of a partition
    fn fetch_watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), ConsumerError>;

    fn subscription(&self) -> Vec<String>;

    fn assignment(&self) -> Vec<Partition>;

    fn member_id(&self) -> Option<String>;

    /// librdkafka's name for the underlying client instance, once it exists
    fn client_instance_name(&self) -> Option<String>;

    fn callbacks(&self) -> &ClientCallbacks;

    fn close(&self);

    fn on_partitions_assigned(&self, handler: PartitionsAssignedHandler) {
        self.callbacks().add_partitions_assigned(handler);
    }

    fn on_partitions_revoked(&self, handler: PartitionsRevokedHandler) {
        self.callbacks().add_partitions_revoked(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.callbacks().add_error(handler);
    }

    fn on_statistics(&self, handler: StatisticsHandler) {
        self.callbacks().add_statistics(handler);
    }
}

/// librdkafka context forwarding client events to the registered handlers
pub struct WorkerPoolConsumerContext {
    callbacks: Arc<ClientCallbacks>,
}

impl WorkerPoolConsumerContext {
    pub fn new(callbacks: Arc<ClientCallbacks>) -> Self {
        Self { callbacks }
    }
}

impl ClientContext for WorkerPoolConsumerContext {
    fn stats_raw(&self, statistics: &[u8]) {
        if self.callbacks.has_statistics_handlers() {
            self.callbacks
                .notify_statistics(&String::from_utf8_lossy(statistics));
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        if is_fatal_error(&error) {
            error!(error = %error, reason = reason, "Fatal librdkafka error");
        } else {
            warn!(error = %error, reason = reason, "librdkafka error");
        }
        self.callbacks.notify_error(&error);
    }
}

impl ConsumerContext for WorkerPoolConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                let revoked: Vec<PartitionOffset> = partitions
                    .elements()
                    .into_iter()
                    .map(|elem| {
                        let offset = match elem.offset() {
                            Offset::Offset(offset) => offset,
                            _ => -1,
                        };
                        PartitionOffset::new(Partition::from(elem), offset)
                    })
                    .collect();
                debug!(count = revoked.len(), "Pre-rebalance revoke");
                self.callbacks.notify_partitions_revoked(&revoked);
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => {
                error!(error = %e, "Rebalance error");
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned: Vec<Partition> = partitions
                .elements()
                .into_iter()
                .map(Partition::from)
                .collect();
            debug!(count = assigned.len(), "Post-rebalance assign");
            self.callbacks.notify_partitions_assigned(&assigned);
        }
    }
}

type WorkerPoolStreamConsumer = StreamConsumer<WorkerPoolConsumerContext>;

/// rdkafka-backed [`BrokerClient`].
///
/// The consumer is created and subscribed on first use. A fatal error drops
/// it and, after [`FATAL_ERROR_BACKOFF`], the next fetch builds a new one.
pub struct KafkaBrokerClient {
    config: ClientConfig,
    topics: Vec<String>,
    callbacks: Arc<ClientCallbacks>,
    consumer: LazyClient<WorkerPoolStreamConsumer>,
    fatal_error_backoff: Duration,
}

impl KafkaBrokerClient {
    pub fn new(config: ClientConfig, topics: Vec<String>) -> Self {
        Self {
            config,
            topics,
            callbacks: Arc::new(ClientCallbacks::default()),
            consumer: LazyClient::new(),
            fatal_error_backoff: FATAL_ERROR_BACKOFF,
        }
    }

    pub fn with_fatal_error_backoff(mut self, backoff: Duration) -> Self {
        self.fatal_error_backoff = backoff;
        self
    }

    fn consumer(&self) -> Result<Arc<WorkerPoolStreamConsumer>, KafkaError> {
        self.consumer.get_or_try_init(|| {
            let context = WorkerPoolConsumerContext::new(self.callbacks.clone());
            let consumer: WorkerPoolStreamConsumer =
                self.config.create_with_context(context)?;

            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();
            consumer.subscribe(&topics)?;

            info!(topics = ?self.topics, "Created Kafka consumer");
            Ok(consumer)
        })
    }

    fn connected(&self) -> Result<Arc<WorkerPoolStreamConsumer>, ConsumerError> {
        self.consumer.get().ok_or(ConsumerError::NotConnected)
    }

    /// Discard the consumer that hit `e` and wait out the backoff; the next
    /// fetch builds a new one. `failed` is `None` when creating it failed.
    async fn recover_from_fatal(
        &self,
        failed: Option<Arc<WorkerPoolStreamConsumer>>,
        e: &KafkaError,
        cancel: &CancellationToken,
    ) {
        error!(
            error = %e,
            backoff = ?self.fatal_error_backoff,
            "Fatal Kafka consumer error, recreating consumer"
        );
        metrics::counter!(CONSUMER_RECREATED).increment(1);

        let discarded = match failed {
            Some(failed) => {
                let cached = self
                    .consumer
                    .invalidate_if(|cached| Arc::ptr_eq(cached, &failed));
                release_client(failed);
                cached
            }
            None => self.consumer.invalidate(),
        };
        if let Some(old) = discarded {
            release_client(old);
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.fatal_error_backoff) => {}
        }
    }
}

#[async_trait]
impl BrokerClient for KafkaBrokerClient {
    async fn fetch_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<KafkaRecord>, ConsumerError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let consumer = match self.consumer() {
                Ok(consumer) => consumer,
                Err(e) if is_fatal_error(&e) => {
                    self.recover_from_fatal(None, &e, cancel).await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = consumer.recv() => result.map(|message| KafkaRecord::from_message(&message)),
            };

            match result {
                Ok(record) => {
                    metrics::counter!(RECORDS_FETCHED).increment(1);
                    return Ok(Some(record));
                }
                Err(e) if is_fatal_error(&e) => {
                    self.recover_from_fatal(Some(consumer), &e, cancel).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        let consumer = self.connected()?;

        let mut list = TopicPartitionList::new();
        for offset in offsets {
            list.add_partition_offset(
                offset.topic(),
                offset.partition_number(),
                Offset::Offset(offset.offset()),
            )?;
        }

        consumer.commit(&list, CommitMode::Sync)?;
        Ok(())
    }

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        let positions = self.connected()?.position()?;
        Ok(positions
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(offset),
                _ => None,
            }))
    }

    fn fetch_watermarks(
        &self,
        partition: &Partition,
        timeout: Duration,
    ) -> Result<(i64, i64), ConsumerError> {
        Ok(self.connected()?.fetch_watermarks(
            partition.topic(),
            partition.partition_number(),
            timeout,
        )?)
    }

    fn subscription(&self) -> Vec<String> {
        let Some(consumer) = self.consumer.get() else {
            return self.topics.clone();
        };

        match consumer.subscription() {
            Ok(list) => list
                .elements()
                .into_iter()
                .map(|elem| elem.topic().to_string())
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read subscription");
                self.topics.clone()
            }
        }
    }

    fn assignment(&self) -> Vec<Partition> {
        let Some(consumer) = self.consumer.get() else {
            return Vec::new();
        };

        match consumer.assignment() {
            Ok(list) => list.elements().into_iter().map(Partition::from).collect(),
            Err(e) => {
                warn!(error = %e, "Failed to read assignment");
                Vec::new()
            }
        }
    }

    /// Not exposed by librdkafka's safe API; always `None`.
    fn member_id(&self) -> Option<String> {
        None
    }

    fn client_instance_name(&self) -> Option<String> {
        self.consumer
            .get()
            .map(|consumer| consumer.client().name().to_string())
    }

    fn callbacks(&self) -> &ClientCallbacks {
        &self.callbacks
    }

    fn close(&self) {
        if let Some(consumer) = self.consumer.invalidate() {
            info!("Closing Kafka consumer");
            // Closing leaves the group and fires the revoke handlers
            match Handle::try_current() {
                Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                    tokio::task::block_in_place(move || drop(consumer));
                }
                _ => drop(consumer),
            }
        }
    }
}

/// Drop a discarded librdkafka handle away from the async workers, closing it blocks.
fn release_client<T: Send + Sync + 'static>(client: Arc<T>) {
    match Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(move || drop(client));
        }
        Err(_) => drop(client),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use parking_lot::Mutex;
    use rdkafka::error::RDKafkaErrorCode;

    use crate::kafka::config::ConsumerConfigBuilder;

    #[test]
    fn test_callbacks_run_in_registration_order() {
        let callbacks = ClientCallbacks::default();
        let calls = Arc::new(Mutex::new(Vec::new()));

        for name in ["engine", "user"] {
            let calls = calls.clone();
            callbacks.add_partitions_assigned(Arc::new(move |partitions: &[Partition]| {
                calls.lock().push(format!("{name}:{}", partitions.len()));
            }));
        }

        callbacks.notify_partitions_assigned(&[Partition::new("events", 0)]);

        assert_eq!(*calls.lock(), vec!["engine:1", "user:1"]);
    }

    #[test]
    fn test_handler_may_register_while_notified() {
        let callbacks = Arc::new(ClientCallbacks::default());
        let count = Arc::new(AtomicUsize::new(0));

        let inner_callbacks = callbacks.clone();
        let inner_count = count.clone();
        callbacks.add_error(Arc::new(move |_: &KafkaError| {
            let count = inner_count.clone();
            inner_callbacks.add_error(Arc::new(move |_: &KafkaError| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        callbacks.notify_error(&KafkaError::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        callbacks.notify_error(&KafkaError::Canceled);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_statistics_forwarded_as_text() {
        let callbacks = Arc::new(ClientCallbacks::default());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        callbacks.add_statistics(Arc::new(move |stats: &str| {
            *sink.lock() = Some(stats.to_string());
        }));

        let context = WorkerPoolConsumerContext::new(callbacks);
        context.stats_raw(br#"{"name":"consumer-1"}"#);

        assert_eq!(seen.lock().as_deref(), Some(r#"{"name":"consumer-1"}"#));
    }

    #[test]
    fn test_unconnected_client_reports_configured_topics() {
        let client = KafkaBrokerClient::new(ClientConfig::new(), vec!["events".to_string()]);

        assert_eq!(client.subscription(), vec!["events".to_string()]);
        assert!(client.client_instance_name().is_none());
        assert!(client.assignment().is_empty());
        assert!(matches!(
            client.commit(&[PartitionOffset::new(Partition::new("events", 0), 1)]),
            Err(ConsumerError::NotConnected)
        ));
        client.close();
    }

    fn offline_client(backoff: Duration) -> KafkaBrokerClient {
        KafkaBrokerClient::new(
            ConsumerConfigBuilder::new("127.0.0.1:1", "test-group").build(),
            vec!["events".to_string()],
        )
        .with_fatal_error_backoff(backoff)
    }

    fn fatal() -> KafkaError {
        KafkaError::Global(RDKafkaErrorCode::Fatal)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fatal_error_rebuilds_consumer_after_backoff() {
        let client = offline_client(Duration::from_millis(50));
        let first = client.consumer().unwrap();
        let first_name = client.client_instance_name().unwrap();

        let started = Instant::now();
        client
            .recover_from_fatal(Some(first.clone()), &fatal(), &CancellationToken::new())
            .await;

        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(client.client_instance_name().is_none());
        assert!(matches!(
            client.commit(&[PartitionOffset::new(Partition::new("events", 0), 1)]),
            Err(ConsumerError::NotConnected)
        ));

        let second = client.consumer().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(client.client_instance_name().unwrap(), first_name);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_ends_fatal_error_backoff() {
        let client = offline_client(Duration::from_secs(60));
        let consumer = client.consumer().unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            client.recover_from_fatal(Some(consumer), &fatal(), &cancel),
        )
        .await
        .expect("cancellation should cut the backoff short");
        assert!(client.client_instance_name().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_late_fatal_error_keeps_replacement_consumer() {
        let client = offline_client(Duration::ZERO);
        let first = client.consumer().unwrap();
        client
            .recover_from_fatal(Some(first.clone()), &fatal(), &CancellationToken::new())
            .await;
        let second = client.consumer().unwrap();

        client
            .recover_from_fatal(Some(first), &fatal(), &CancellationToken::new())
            .await;

        assert!(Arc::ptr_eq(&client.consumer().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_fetch_returns_none_when_cancelled() {
        let client = KafkaBrokerClient::new(ClientConfig::new(), vec!["events".to_string()]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(client.fetch_next(&cancel).await.unwrap().is_none());
    }
}
