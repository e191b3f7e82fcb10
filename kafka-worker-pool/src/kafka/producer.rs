use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, ClientContext};
use tracing::{debug, error, info, warn};

use crate::error::{is_fatal_error, ProduceError};
use crate::kafka::client::{ClientCallbacks, ErrorHandler, StatisticsHandler};
use crate::kafka::lazy_client::LazyClient;
use crate::kafka::metrics_consts::{PRODUCER_RECREATED, PRODUCE_FAILURES};
use crate::kafka::types::MessageHeaders;

/// One built librdkafka producer; `id` tells replaced instances apart
struct ProducerInstance {
    id: u64,
    producer: FutureProducer<ResilientProducerContext>,
}

type ProducerHolder = LazyClient<ProducerInstance>;

/// Where a produced record ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

pub struct ResilientProducerContext {
    name: String,
    instance_id: u64,
    holder: Weak<ProducerHolder>,
    callbacks: Arc<ClientCallbacks>,
}

impl ResilientProducerContext {
    fn new(
        name: String,
        instance_id: u64,
        holder: Weak<ProducerHolder>,
        callbacks: Arc<ClientCallbacks>,
    ) -> Self {
        Self {
            name,
            instance_id,
            holder,
            callbacks,
        }
    }
}

impl ClientContext for ResilientProducerContext {
    fn stats_raw(&self, statistics: &[u8]) {
        if self.callbacks.has_statistics_handlers() {
            self.callbacks
                .notify_statistics(&String::from_utf8_lossy(statistics));
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        if is_fatal_error(&error) {
            error!(
                producer = %self.name,
                error = %error,
                reason = reason,
                "Fatal producer error, producer will be recreated"
            );
            // Runs on the producer's poll thread, which dropping the producer joins
            if let Some(holder) = self.holder.upgrade() {
                discard(
                    holder.invalidate_if(|cached| cached.id == self.instance_id),
                    None,
                );
            }
        } else {
            warn!(producer = %self.name, error = %error, reason = reason, "Producer error");
        }
        self.callbacks.notify_error(&error);
    }
}

/// Produce client that builds its librdkafka producer on first use and
/// replaces it after a fatal error.
///
/// Non-fatal errors are returned to the caller and the producer is kept.
pub struct ResilientProducer {
    name: String,
    default_topic: Option<String>,
    config: ClientConfig,
    producer: Arc<ProducerHolder>,
    next_instance_id: AtomicU64,
    callbacks: Arc<ClientCallbacks>,
}

impl ResilientProducer {
    pub fn new(name: impl Into<String>, config: ClientConfig) -> Self {
        Self {
            name: name.into(),
            default_topic: None,
            config,
            producer: Arc::new(LazyClient::new()),
            next_instance_id: AtomicU64::new(0),
            callbacks: Arc::new(ClientCallbacks::default()),
        }
    }

    pub fn with_default_topic(mut self, topic: impl Into<String>) -> Self {
        self.default_topic = Some(topic.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_topic(&self) -> Option<&str> {
        self.default_topic.as_deref()
    }

    pub fn on_error(&self, handler: ErrorHandler) {
        self.callbacks.add_error(handler);
    }

    pub fn on_statistics(&self, handler: StatisticsHandler) {
        self.callbacks.add_statistics(handler);
    }

    /// Whether a producer instance is currently built
    pub fn is_connected(&self) -> bool {
        self.producer.is_initialized()
    }

    fn producer(&self) -> Result<Arc<ProducerInstance>, KafkaError> {
        self.producer.get_or_try_init(|| {
            let id = self.next_instance_id.fetch_add(1, Ordering::SeqCst);
            let context = ResilientProducerContext::new(
                self.name.clone(),
                id,
                Arc::downgrade(&self.producer),
                self.callbacks.clone(),
            );
            let producer: FutureProducer<ResilientProducerContext> =
                self.config.create_with_context(context)?;
            info!(producer = %self.name, instance = id, "Created Kafka producer");
            Ok(ProducerInstance { id, producer })
        })
    }

    /// Produce a record and wait for its delivery report
    pub async fn produce(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: Option<&MessageHeaders>,
    ) -> Result<DeliveryReport, ProduceError> {
        let instance = self.producer()?;

        let record = FutureRecord {
            topic,
            partition: None,
            payload: Some(payload),
            key,
            timestamp: None,
            headers: headers.map(MessageHeaders::to_owned_headers),
        };

        let delivery = match instance.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((e, _)) => return Err(self.failed(instance, topic, e)),
        };

        match delivery.await {
            Ok(Ok((partition, offset))) => {
                debug!(
                    producer = %self.name,
                    topic = topic,
                    partition = partition,
                    offset = offset,
                    "Delivered record"
                );
                Ok(DeliveryReport {
                    topic: topic.to_string(),
                    partition,
                    offset,
                })
            }
            Ok(Err((e, _))) => Err(self.failed(instance, topic, e)),
            Err(_) => {
                metrics::counter!(PRODUCE_FAILURES, "reason" => "canceled").increment(1);
                Err(ProduceError::Canceled)
            }
        }
    }

    /// Produce to the configured default topic
    pub async fn produce_to_default(
        &self,
        key: Option<&[u8]>,
        payload: &[u8],
        headers: Option<&MessageHeaders>,
    ) -> Result<DeliveryReport, ProduceError> {
        let Some(topic) = self.default_topic.as_deref() else {
            return Err(ProduceError::NoDefaultTopic(self.name.clone()));
        };
        self.produce(topic, key, payload, headers).await
    }

    /// Produce in the background and hand the outcome to `on_delivery`
    pub fn produce_detached<F>(
        self: &Arc<Self>,
        topic: String,
        key: Option<Vec<u8>>,
        payload: Vec<u8>,
        headers: Option<MessageHeaders>,
        on_delivery: F,
    ) where
        F: FnOnce(Result<DeliveryReport, ProduceError>) + Send + 'static,
    {
        let producer = self.clone();
        tokio::spawn(async move {
            let result = producer
                .produce(&topic, key.as_deref(), &payload, headers.as_ref())
                .await;
            on_delivery(result);
        });
    }

    /// Wait for queued records to be delivered
    pub fn flush(&self, timeout: Duration) -> Result<(), ProduceError> {
        match self.producer.get() {
            Some(instance) => Ok(instance.producer.flush(timeout)?),
            None => Ok(()),
        }
    }

    fn failed(
        &self,
        instance: Arc<ProducerInstance>,
        topic: &str,
        e: KafkaError,
    ) -> ProduceError {
        metrics::counter!(PRODUCE_FAILURES, "reason" => "kafka").increment(1);

        if is_fatal_error(&e) {
            error!(
                producer = %self.name,
                topic = topic,
                error = %e,
                "Fatal delivery error, producer will be recreated"
            );
            let cached = self
                .producer
                .invalidate_if(|cached| Arc::ptr_eq(cached, &instance));
            discard(cached, Some(instance));
        } else {
            warn!(producer = %self.name, topic = topic, error = %e, "Failed to produce record");
        }

        ProduceError::Kafka(e)
    }
}

/// Release discarded producers on a plain thread; dropping one joins its poll thread
fn discard(cached: Option<Arc<ProducerInstance>>, current: Option<Arc<ProducerInstance>>) {
    if cached.is_some() {
        metrics::counter!(PRODUCER_RECREATED).increment(1);
    }
    if cached.is_none() && current.is_none() {
        return;
    }

    std::thread::spawn(move || {
        drop(cached);
        drop(current);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use rdkafka::error::RDKafkaErrorCode;

    use crate::kafka::config::ProducerConfigBuilder;

    fn fatal() -> KafkaError {
        KafkaError::Global(RDKafkaErrorCode::Fatal)
    }

    fn context_for(producer: &ResilientProducer, instance_id: u64) -> ResilientProducerContext {
        ResilientProducerContext::new(
            producer.name.clone(),
            instance_id,
            Arc::downgrade(&producer.producer),
            producer.callbacks.clone(),
        )
    }

    fn unreachable_config() -> ClientConfig {
        ProducerConfigBuilder::new("127.0.0.1:1")
            .with_message_timeout_ms(200)
            .build()
    }

    #[tokio::test]
    async fn test_produce_to_default_requires_topic() {
        let producer = ResilientProducer::new("test-producer", unreachable_config());

        let result = producer.produce_to_default(None, b"payload", None).await;

        assert!(matches!(result, Err(ProduceError::NoDefaultTopic(name)) if name == "test-producer"));
        assert!(!producer.is_connected());
    }

    #[tokio::test]
    async fn test_non_fatal_delivery_error_keeps_producer() {
        let producer = ResilientProducer::new("test-producer", unreachable_config())
            .with_default_topic("events");

        let result = producer
            .produce_to_default(Some(b"key"), b"payload", None)
            .await;

        assert!(matches!(result, Err(ProduceError::Kafka(_))));
        assert!(producer.is_connected());
    }

    #[tokio::test]
    async fn test_fatal_error_invalidates_producer() {
        let producer = ResilientProducer::new("test-producer", unreachable_config());
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = errors.clone();
        producer.on_error(Arc::new(move |_: &KafkaError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let first = producer.producer().unwrap();
        assert!(producer.is_connected());

        context_for(&producer, first.id).error(fatal(), "test");

        assert!(!producer.is_connected());
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        let second = producer.producer().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_late_fatal_error_keeps_replacement_producer() {
        let producer = ResilientProducer::new("test-producer", unreachable_config());
        let first = producer.producer().unwrap();
        context_for(&producer, first.id).error(fatal(), "test");
        let second = producer.producer().unwrap();

        // Errors reported for the replaced instance arrive after the rebuild
        context_for(&producer, first.id).error(fatal(), "late");
        assert!(matches!(
            producer.failed(first, "events", fatal()),
            ProduceError::Kafka(_)
        ));

        assert!(producer.is_connected());
        assert!(Arc::ptr_eq(&producer.producer().unwrap(), &second));
    }

    #[tokio::test]
    async fn test_produce_detached_reports_outcome() {
        let producer = Arc::new(ResilientProducer::new("test-producer", unreachable_config()));
        let (tx, rx) = tokio::sync::oneshot::channel();

        producer.produce_detached(
            "events".to_string(),
            None,
            b"payload".to_vec(),
            None,
            move |result| {
                tx.send(result.is_err()).ok();
            },
        );

        let failed = tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("delivery callback should run")
            .unwrap();
        assert!(failed);
    }
}
