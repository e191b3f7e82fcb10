// ==== Feeder metrics ====
/// Counter for records fetched from the broker
pub const RECORDS_FETCHED: &str = "kafka_worker_pool_records_fetched_total";

/// Counter for non-fatal fetch failures
pub const FETCH_ERRORS: &str = "kafka_worker_pool_fetch_errors_total";

/// Counter for fatal broker errors that caused the client to be rebuilt
pub const CONSUMER_RECREATED: &str = "kafka_worker_pool_consumer_recreated_total";

/// Counter for records dropped before reaching a worker
pub const RECORDS_DROPPED: &str = "kafka_worker_pool_records_dropped_total";

// ==== Worker metrics ====
/// Histogram for handler execution time
pub const HANDLER_DURATION: &str = "kafka_worker_pool_handler_duration_seconds";

/// Counter for handler errors and panics
pub const HANDLER_FAILURES: &str = "kafka_worker_pool_handler_failures_total";

/// Counter for records dropped from worker queues on stop
pub const RECORDS_DISCARDED_ON_STOP: &str = "kafka_worker_pool_records_discarded_on_stop_total";

// ==== Offset metrics ====
/// Counter for out-of-order completions held back by the tracker
pub const OUT_OF_ORDER_COMPLETIONS: &str = "kafka_worker_pool_out_of_order_completions_total";

/// Counter for successful batched commits
pub const COMMITS: &str = "kafka_worker_pool_commits_total";

/// Counter for failed batched commits
pub const COMMIT_FAILURES: &str = "kafka_worker_pool_commit_failures_total";

/// Gauge for the last committed offset per partition
pub const PARTITION_LAST_COMMITTED_OFFSET: &str = "kafka_worker_pool_partition_last_committed_offset";

// ==== Pool lifecycle metrics ====
/// Counter for pool generations started
pub const POOL_STARTS: &str = "kafka_worker_pool_starts_total";

/// Counter for pool generations stopped
pub const POOL_STOPS: &str = "kafka_worker_pool_stops_total";

/// Gauge for partitions owned by the active generation
pub const ASSIGNED_PARTITIONS: &str = "kafka_worker_pool_assigned_partitions";

// ==== Producer metrics ====
/// Counter for producer instances rebuilt after a fatal error
pub const PRODUCER_RECREATED: &str = "kafka_worker_pool_producer_recreated_total";

/// Counter for failed deliveries
pub const PRODUCE_FAILURES: &str = "kafka_worker_pool_produce_failures_total";
