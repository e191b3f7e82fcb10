//! Consumer Worker - One of the pool's parallel record processors
//!
//! Each worker owns a bounded queue and a task that drains it, running the
//! application handler once per record. The bounded queue is where
//! backpressure reaches the feeder: `enqueue` waits while it is full.
//!
//! Handler failures never stop a worker. On stop, the record in flight is
//! finished and anything still queued is dropped without being marked
//! processed, so it will be consumed again after the next assignment.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::ConsumerError;
use crate::kafka::distribution::{TaskCompletedCallback, Worker};
use crate::kafka::handler::{MessageContext, MessageHandler};
use crate::kafka::metrics_consts::{HANDLER_DURATION, HANDLER_FAILURES, RECORDS_DISCARDED_ON_STOP};
use crate::kafka::offset_tracker::OffsetTracker;
use crate::kafka::types::KafkaRecord;

/// Settings shared by every worker of a pool
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub consumer_name: Arc<str>,
    pub group_id: Arc<str>,
    /// Capacity of each worker's queue
    pub buffer_size: usize,
    /// Mark each record processed once its handler returns
    pub auto_store_offsets: bool,
}

pub struct ConsumerWorker {
    id: usize,
    sender: mpsc::Sender<KafkaRecord>,
    stopped: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    task_completed: Arc<RwLock<Option<TaskCompletedCallback>>>,
}

impl ConsumerWorker {
    /// Create a worker and spawn its processing loop
    pub fn start(
        id: usize,
        handler: Arc<dyn MessageHandler>,
        tracker: Arc<OffsetTracker>,
        settings: &WorkerSettings,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(settings.buffer_size.max(1));
        let stopped = CancellationToken::new();
        let task_completed: Arc<RwLock<Option<TaskCompletedCallback>>> = Arc::new(RwLock::new(None));

        let task = tokio::spawn(Self::run(
            id,
            receiver,
            handler,
            tracker,
            settings.clone(),
            stopped.clone(),
            task_completed.clone(),
        ));

        Arc::new(Self {
            id,
            sender,
            stopped,
            task: Mutex::new(Some(task)),
            task_completed,
        })
    }

    /// Queue a record, waiting while the queue is full
    pub async fn enqueue(
        &self,
        record: KafkaRecord,
        cancel: &CancellationToken,
    ) -> Result<(), ConsumerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConsumerError::Cancelled),
            _ = self.stopped.cancelled() => Err(ConsumerError::WorkerStopped(self.id)),
            result = self.sender.send(record) => {
                result.map_err(|_| ConsumerError::WorkerStopped(self.id))
            }
        }
    }

    /// Records waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    /// Stop the worker, letting the record in flight finish
    pub async fn stop(&self) {
        self.stopped.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            match task.await {
                Ok(()) => debug!(worker_id = self.id, "Worker stopped"),
                Err(e) => warn!(worker_id = self.id, error = %e, "Worker task ended abnormally"),
            }
        }
    }

    async fn run(
        id: usize,
        mut receiver: mpsc::Receiver<KafkaRecord>,
        handler: Arc<dyn MessageHandler>,
        tracker: Arc<OffsetTracker>,
        settings: WorkerSettings,
        stopped: CancellationToken,
        task_completed: Arc<RwLock<Option<TaskCompletedCallback>>>,
    ) {
        debug!(worker_id = id, consumer = %settings.consumer_name, "Worker started");

        loop {
            let record = tokio::select! {
                biased;
                _ = stopped.cancelled() => break,
                record = receiver.recv() => match record {
                    Some(record) => record,
                    None => break,
                },
            };

            Self::process(id, record, &handler, &tracker, &settings, &stopped).await;

            let callback = task_completed.read().clone();
            if let Some(callback) = callback {
                callback();
            }
        }

        receiver.close();
        let mut discarded = 0u64;
        while receiver.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            debug!(
                worker_id = id,
                discarded = discarded,
                "Dropped queued records on stop"
            );
            metrics::counter!(RECORDS_DISCARDED_ON_STOP).increment(discarded);
        }
    }

    async fn process(
        id: usize,
        record: KafkaRecord,
        handler: &Arc<dyn MessageHandler>,
        tracker: &Arc<OffsetTracker>,
        settings: &WorkerSettings,
        stopped: &CancellationToken,
    ) {
        let context = MessageContext::new(
            record,
            id,
            settings.consumer_name.clone(),
            settings.group_id.clone(),
            stopped.clone(),
            tracker.clone(),
        );

        let started = Instant::now();
        let result = AssertUnwindSafe(handler.handle(&context))
            .catch_unwind()
            .await;
        metrics::histogram!(HANDLER_DURATION).record(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(
                    topic = context.partition().topic(),
                    partition = context.partition().partition_number(),
                    offset = context.offset(),
                    worker_id = id,
                    consumer = %settings.consumer_name,
                    error = ?e,
                    "Message handler failed"
                );
                metrics::counter!(HANDLER_FAILURES, "kind" => "error").increment(1);
            }
            Err(panic) => {
                error!(
                    topic = context.partition().topic(),
                    partition = context.partition().partition_number(),
                    offset = context.offset(),
                    worker_id = id,
                    consumer = %settings.consumer_name,
                    panic = panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
                metrics::counter!(HANDLER_FAILURES, "kind" => "panic").increment(1);
            }
        }

        if settings.auto_store_offsets && context.should_store_offset() {
            context.store_offset();
        }
    }
}

impl Worker for ConsumerWorker {
    fn id(&self) -> usize {
        self.id
    }

    fn on_task_completed(&self, callback: TaskCompletedCallback) {
        *self.task_completed.write() = Some(callback);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic"
    }
}
