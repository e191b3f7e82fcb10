use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::{KafkaRecord, MessageHeaders, Partition};

/// Application code run by the workers for every record.
///
/// An error (or a panic) is logged by the worker and the record is treated as
/// done; with automatic offset storage the partition still advances past it.
/// Handlers that need retries must do them themselves.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, context: &MessageContext) -> anyhow::Result<()>;
}

/// Everything a handler gets to see about the record it is processing
pub struct MessageContext {
    record: KafkaRecord,
    worker_id: usize,
    consumer_name: Arc<str>,
    group_id: Arc<str>,
    worker_stopped: CancellationToken,
    tracker: Arc<OffsetTracker>,
    should_store_offset: AtomicBool,
    offset_stored: AtomicBool,
}

impl MessageContext {
    pub fn new(
        record: KafkaRecord,
        worker_id: usize,
        consumer_name: Arc<str>,
        group_id: Arc<str>,
        worker_stopped: CancellationToken,
        tracker: Arc<OffsetTracker>,
    ) -> Self {
        Self {
            record,
            worker_id,
            consumer_name,
            group_id,
            worker_stopped,
            tracker,
            should_store_offset: AtomicBool::new(true),
            offset_stored: AtomicBool::new(false),
        }
    }

    pub fn record(&self) -> &KafkaRecord {
        &self.record
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.record.key()
    }

    pub fn payload(&self) -> &[u8] {
        self.record.payload()
    }

    pub fn headers(&self) -> &MessageHeaders {
        self.record.headers()
    }

    pub fn partition(&self) -> &Partition {
        self.record.partition()
    }

    pub fn offset(&self) -> i64 {
        self.record.offset()
    }

    pub fn timestamp(&self) -> Option<i64> {
        self.record.timestamp()
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    /// Cancelled when the worker running this handler is asked to stop.
    /// Long handlers should watch it and finish early.
    pub fn worker_stopped(&self) -> &CancellationToken {
        &self.worker_stopped
    }

    /// Mark this record processed now. Used with manual offset storage, or to
    /// release the offset before a slow handler returns.
    ///
    /// Only the first call counts, and the worker will not store it again.
    pub fn store_offset(&self) -> bool {
        self.should_store_offset.store(false, Ordering::SeqCst);
        if self.offset_stored.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.tracker
            .mark_processed(self.record.partition(), self.record.offset())
    }

    /// Set to false to keep the worker from storing this offset after the
    /// handler returns
    pub fn set_should_store_offset(&self, store: bool) {
        self.should_store_offset.store(store, Ordering::SeqCst);
    }

    pub fn should_store_offset(&self) -> bool {
        self.should_store_offset.load(Ordering::SeqCst)
    }
}
