// Kafka module - worker pool consumption with ordered offset commits
pub mod client;
pub mod config;
pub mod distribution;
pub mod feeder;
pub mod handler;
pub mod lazy_client;
pub mod manager;
pub mod metrics_consts;
pub mod offset_committer;
pub mod offset_tracker;
pub mod producer;
pub mod types;
pub mod worker;
pub mod worker_pool;

// Used in "mod tests" and tests/ directory (integration tests)
pub mod test_utils;

// Public API
pub use client::{BrokerClient, KafkaBrokerClient};
pub use config::{ConsumerConfigBuilder, ProducerConfigBuilder};
pub use distribution::{DistributionStrategy, DistributionStrategyKind};
pub use handler::{MessageContext, MessageHandler};
pub use manager::{ConsumerManager, ConsumerSettings};
pub use producer::{DeliveryReport, ResilientProducer};
pub use types::{ConsumerState, KafkaRecord, MessageHeaders, Partition, PartitionOffset};
