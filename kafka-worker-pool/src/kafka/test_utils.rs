use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::client::{BrokerClient, ClientCallbacks};
use super::handler::{MessageContext, MessageHandler};
use super::offset_tracker::OffsetStore;
use super::types::{KafkaRecord, MessageHeaders, Partition, PartitionOffset};
use crate::error::ConsumerError;

/// Test utilities for kafka module tests
pub fn record(topic: &str, partition: i32, offset: i64, key: Option<&str>) -> KafkaRecord {
    KafkaRecord::new(
        Partition::new(topic, partition),
        offset,
        key.map(|k| k.as_bytes().to_vec()),
        format!("payload-{offset}").into_bytes(),
        MessageHeaders::new(),
        Some(1_700_000_000_000 + offset),
    )
}

/// Something the scripted client does when the feeder next fetches
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    Assign(Vec<Partition>),
    Revoke(Vec<Partition>),
    Record(KafkaRecord),
    Error(KafkaError),
}

/// In-memory broker client driven by a script of events.
///
/// Rebalance events fire the registered handlers inline from `fetch_next`,
/// the same way librdkafka serves rebalances from the polling thread.
pub struct ScriptedBrokerClient {
    topics: Vec<String>,
    events: Mutex<VecDeque<ScriptedEvent>>,
    pushed: Notify,
    callbacks: ClientCallbacks,
    assignment: Mutex<Vec<Partition>>,
    commits: Mutex<Vec<Vec<PartitionOffset>>>,
    commit_attempts: AtomicUsize,
    failing_commits: AtomicUsize,
    fetches: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedBrokerClient {
    pub fn new(topics: Vec<&str>) -> Self {
        Self {
            topics: topics.into_iter().map(String::from).collect(),
            events: Mutex::new(VecDeque::new()),
            pushed: Notify::new(),
            callbacks: ClientCallbacks::default(),
            assignment: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
            commit_attempts: AtomicUsize::new(0),
            failing_commits: AtomicUsize::new(0),
            fetches: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn push(&self, event: ScriptedEvent) {
        self.events.lock().push_back(event);
        self.pushed.notify_one();
    }

    pub fn push_assign(&self, partitions: Vec<Partition>) {
        self.push(ScriptedEvent::Assign(partitions));
    }

    pub fn push_revoke(&self, partitions: Vec<Partition>) {
        self.push(ScriptedEvent::Revoke(partitions));
    }

    pub fn push_record(&self, record: KafkaRecord) {
        self.push(ScriptedEvent::Record(record));
    }

    pub fn push_records(&self, records: impl IntoIterator<Item = KafkaRecord>) {
        for record in records {
            self.push_record(record);
        }
    }

    pub fn push_error(&self, error: KafkaError) {
        self.push(ScriptedEvent::Error(error));
    }

    pub fn pending_events(&self) -> usize {
        self.events.lock().len()
    }

    /// Make the next `count` commits fail
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Successful commits, one entry per call
    pub fn commits(&self) -> Vec<Vec<PartitionOffset>> {
        self.commits.lock().clone()
    }

    pub fn commit_attempts(&self) -> usize {
        self.commit_attempts.load(Ordering::SeqCst)
    }

    /// Latest committed offset for a partition
    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.commits
            .lock()
            .iter()
            .flatten()
            .filter(|offset| offset.partition() == partition)
            .map(PartitionOffset::offset)
            .next_back()
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Wait until `predicate` holds or the timeout elapses
    pub async fn wait_until(&self, timeout: Duration, predicate: impl Fn(&Self) -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if predicate(self) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        predicate(self)
    }
}

#[async_trait]
impl BrokerClient for ScriptedBrokerClient {
    async fn fetch_next(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<KafkaRecord>, ConsumerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);

        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }

            let event = self.events.lock().pop_front();
            match event {
                Some(ScriptedEvent::Record(record)) => return Ok(Some(record)),
                Some(ScriptedEvent::Error(error)) => return Err(error.into()),
                Some(ScriptedEvent::Assign(partitions)) => {
                    *self.assignment.lock() = partitions.clone();
                    self.callbacks.notify_partitions_assigned(&partitions);
                }
                Some(ScriptedEvent::Revoke(partitions)) => {
                    let revoked: Vec<PartitionOffset> = partitions
                        .into_iter()
                        .map(|partition| PartitionOffset::new(partition, -1))
                        .collect();
                    self.callbacks.notify_partitions_revoked(&revoked);
                    self.assignment
                        .lock()
                        .retain(|p| !revoked.iter().any(|r| r.partition() == p));
                }
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = self.pushed.notified() => {}
                    }
                }
            }
        }
    }

    fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), ConsumerError> {
        self.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let failing = self.failing_commits.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_commits.store(failing - 1, Ordering::SeqCst);
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut).into());
        }

        self.commits.lock().push(offsets.to_vec());
        Ok(())
    }

    fn position(&self, partition: &Partition) -> Result<Option<i64>, ConsumerError> {
        Ok(self.committed(partition))
    }

    fn fetch_watermarks(
        &self,
        _partition: &Partition,
        _timeout: Duration,
    ) -> Result<(i64, i64), ConsumerError> {
        Ok((0, 0))
    }

    fn subscription(&self) -> Vec<String> {
        self.topics.clone()
    }

    fn assignment(&self) -> Vec<Partition> {
        self.assignment.lock().clone()
    }

    fn member_id(&self) -> Option<String> {
        Some("scripted-member".to_string())
    }

    fn client_instance_name(&self) -> Option<String> {
        Some("scripted#consumer-1".to_string())
    }

    fn callbacks(&self) -> &ClientCallbacks {
        &self.callbacks
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// What a [`RecordingHandler`] saw for one record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedRecord {
    pub worker_id: usize,
    pub partition: Partition,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
}

/// Handler that records every invocation, with optional scripted misbehaviour
#[derive(Default)]
pub struct RecordingHandler {
    processed: Mutex<Vec<ProcessedRecord>>,
    delay: Option<Duration>,
    fail_on: HashSet<i64>,
    panic_on: HashSet<i64>,
    skip_store_on: HashSet<i64>,
    store_manually_on: HashSet<i64>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.fail_on.extend(offsets);
        self
    }

    pub fn panicking_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.panic_on.extend(offsets);
        self
    }

    pub fn skipping_store_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.skip_store_on.extend(offsets);
        self
    }

    pub fn storing_manually_on(mut self, offsets: impl IntoIterator<Item = i64>) -> Self {
        self.store_manually_on.extend(offsets);
        self
    }

    pub fn processed(&self) -> Vec<ProcessedRecord> {
        self.processed.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.processed.lock().len()
    }

    /// Offsets seen by each worker, in processing order
    pub fn offsets_by_worker(&self) -> HashMap<usize, Vec<i64>> {
        let mut by_worker: HashMap<usize, Vec<i64>> = HashMap::new();
        for record in self.processed.lock().iter() {
            by_worker.entry(record.worker_id).or_default().push(record.offset);
        }
        by_worker
    }

    /// Wait until at least `count` records were handled
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= count
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, context: &MessageContext) -> Result<()> {
        let offset = context.offset();

        self.processed.lock().push(ProcessedRecord {
            worker_id: context.worker_id(),
            partition: context.partition().clone(),
            offset,
            key: context.key().map(<[u8]>::to_vec),
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.skip_store_on.contains(&offset) {
            context.set_should_store_offset(false);
        }
        if self.store_manually_on.contains(&offset) {
            context.store_offset();
        }
        if self.panic_on.contains(&offset) {
            panic!("scripted panic at offset {offset}");
        }
        if self.fail_on.contains(&offset) {
            bail!("scripted failure at offset {offset}");
        }

        Ok(())
    }
}

/// Offset store that remembers everything staged with it
#[derive(Default)]
pub struct RecordingOffsetStore {
    stored: Mutex<Vec<PartitionOffset>>,
}

impl RecordingOffsetStore {
    pub fn stored(&self) -> Vec<PartitionOffset> {
        self.stored.lock().clone()
    }

    pub fn last_stored(&self, partition: &Partition) -> Option<i64> {
        self.stored
            .lock()
            .iter()
            .filter(|offset| offset.partition() == partition)
            .map(PartitionOffset::offset)
            .next_back()
    }
}

impl OffsetStore for RecordingOffsetStore {
    fn store_offset(&self, offset: PartitionOffset) {
        self.stored.lock().push(offset);
    }
}

/// Wrap any test double as the trait object the pool expects
pub fn shared_client(client: &Arc<ScriptedBrokerClient>) -> Arc<dyn BrokerClient> {
    client.clone()
}
