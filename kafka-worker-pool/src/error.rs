use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use thiserror::Error;

use crate::kafka::types::ConsumerState;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Consumer is {0:?}, expected {1:?}")]
    InvalidState(ConsumerState, ConsumerState),

    #[error("No offsets given to override")]
    EmptyOffsets,

    #[error("Kafka consumer has not been created yet")]
    NotConnected,

    #[error("Consumer requires the multi-threaded Tokio runtime")]
    UnsupportedRuntime,

    #[error("Worker {0} has stopped")]
    WorkerStopped(usize),

    #[error("Operation cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("No topic given and producer {0} has no default topic")]
    NoDefaultTopic(String),

    #[error("Delivery was cancelled before a report arrived")]
    Canceled,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Worker count must be between 1 and 255, got {0}")]
    WorkerCount(usize),

    #[error("Buffer size must be greater than zero")]
    BufferSize,

    #[error("Consumer group id is required")]
    MissingGroupId,

    #[error("At least one topic is required")]
    MissingTopics,

    #[error("Unknown distribution strategy: {0}")]
    UnknownStrategy(String),
}

/// Fatal errors leave the librdkafka handle unusable; it must be rebuilt.
pub fn is_fatal_error(error: &KafkaError) -> bool {
    matches!(error, KafkaError::MessageConsumptionFatal(_))
        || error.rdkafka_error_code() == Some(RDKafkaErrorCode::Fatal)
}
