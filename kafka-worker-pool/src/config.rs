use std::time::Duration;

use envconfig::Envconfig;
use rdkafka::ClientConfig;

use crate::error::ConfigError;
use crate::kafka::config::{ConsumerConfigBuilder, ProducerConfigBuilder};
use crate::kafka::distribution::DistributionStrategyKind;
use crate::kafka::manager::ConsumerSettings;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Kafka connection
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Consumer configuration
    #[envconfig(default = "kafka-worker-pool")]
    pub kafka_consumer_group: String,

    // Comma separated
    #[envconfig(default = "events")]
    pub kafka_consumer_topics: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String,

    // Generated when unset
    pub consumer_name: Option<String>,

    #[envconfig(default = "60000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,

    // Worker pool configuration
    #[envconfig(default = "10")]
    pub worker_count: usize,

    #[envconfig(default = "100")]
    pub worker_buffer_size: usize,

    #[envconfig(default = "true")]
    pub auto_store_offsets: bool,

    #[envconfig(default = "5000")]
    pub auto_commit_interval_ms: u64,

    #[envconfig(default = "key_hash")]
    pub distribution_strategy: String,

    // 0 disables librdkafka statistics
    #[envconfig(default = "0")]
    pub kafka_statistics_interval_ms: u32,

    // Kafka Producer configuration
    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32,

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32,

    #[envconfig(default = "10000000")]
    pub kafka_producer_queue_messages: u32,

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32,

    #[envconfig(default = "snappy")]
    pub kafka_compression_codec: String,

    pub kafka_producer_default_topic: Option<String>,
}

impl Config {
    pub fn init_with_defaults() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    /// Subscribed topics, blanks removed
    pub fn topics(&self) -> Vec<String> {
        self.kafka_consumer_topics
            .split(',')
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    pub fn distribution_strategy(&self) -> Result<DistributionStrategyKind, ConfigError> {
        self.distribution_strategy.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.to_consumer_settings()?.validate()
    }

    /// Convert to the settings a [`crate::kafka::manager::ConsumerManager`] is built from
    pub fn to_consumer_settings(&self) -> Result<ConsumerSettings, ConfigError> {
        let mut settings = ConsumerSettings::new(self.kafka_consumer_group.clone(), self.topics())
            .with_workers(self.worker_count, self.worker_buffer_size)
            .with_auto_store_offsets(self.auto_store_offsets)
            .with_auto_commit_interval(self.auto_commit_interval())
            .with_strategy(self.distribution_strategy()?);

        if let Some(name) = self.consumer_name.as_deref().filter(|n| !n.trim().is_empty()) {
            settings = settings.with_consumer_name(name);
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn consumer_client_config(&self, client_id: &str) -> ClientConfig {
        let mut builder =
            ConsumerConfigBuilder::new(&self.kafka_hosts, &self.kafka_consumer_group)
                .with_tls(self.kafka_tls)
                .with_client_id(client_id)
                .with_offset_reset(&self.kafka_consumer_offset_reset)
                .with_session_timeout_ms(self.kafka_session_timeout_ms)
                .with_max_poll_interval_ms(self.kafka_max_poll_interval_ms);

        if self.kafka_statistics_interval_ms > 0 {
            builder = builder.with_statistics_interval_ms(self.kafka_statistics_interval_ms);
        }

        builder.build()
    }

    pub fn producer_client_config(&self) -> ClientConfig {
        let mut builder = ProducerConfigBuilder::new(&self.kafka_hosts)
            .with_tls(self.kafka_tls)
            .with_linger_ms(self.kafka_producer_linger_ms)
            .with_message_timeout_ms(self.kafka_message_timeout_ms)
            .with_compression_codec(&self.kafka_compression_codec)
            .with_queue_limits(
                self.kafka_producer_queue_mib,
                self.kafka_producer_queue_messages,
            );

        if self.kafka_statistics_interval_ms > 0 {
            builder = builder.with_statistics_interval_ms(self.kafka_statistics_interval_ms);
        }

        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);

        assert_eq!(config.kafka_hosts, "localhost:9092");
        assert_eq!(config.topics(), vec!["events".to_string()]);
        assert_eq!(config.worker_count, 10);
        assert!(config.auto_store_offsets);
        assert_eq!(config.auto_commit_interval(), Duration::from_secs(5));
        assert_eq!(
            config.distribution_strategy().unwrap(),
            DistributionStrategyKind::KeyHash
        );
        assert!(config.consumer_name.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topics_are_split_and_trimmed() {
        let config = config_from(&[("KAFKA_CONSUMER_TOPICS", " clicks, ,views ,")]);

        assert_eq!(
            config.topics(),
            vec!["clicks".to_string(), "views".to_string()]
        );
    }

    #[test]
    fn test_consumer_settings_carry_overrides() {
        let config = config_from(&[
            ("CONSUMER_NAME", "ingest"),
            ("WORKER_COUNT", "4"),
            ("WORKER_BUFFER_SIZE", "8"),
            ("AUTO_STORE_OFFSETS", "false"),
            ("DISTRIBUTION_STRATEGY", "free_worker"),
        ]);

        let settings = config.to_consumer_settings().unwrap();

        assert_eq!(settings.consumer_name, "ingest");
        assert_eq!(settings.worker_count, 4);
        assert_eq!(settings.buffer_size, 8);
        assert!(!settings.auto_store_offsets);
    }

    #[test]
    fn test_generated_consumer_name() {
        let settings = config_from(&[]).to_consumer_settings().unwrap();

        assert!(settings.consumer_name.starts_with("Consumer_"));
    }

    #[test]
    fn test_validation_errors() {
        let config = config_from(&[("WORKER_COUNT", "256")]);
        assert!(matches!(config.validate(), Err(ConfigError::WorkerCount(256))));

        let config = config_from(&[("WORKER_COUNT", "0")]);
        assert!(matches!(config.validate(), Err(ConfigError::WorkerCount(0))));

        let config = config_from(&[("WORKER_BUFFER_SIZE", "0")]);
        assert!(matches!(config.validate(), Err(ConfigError::BufferSize)));

        let config = config_from(&[("KAFKA_CONSUMER_TOPICS", " , ")]);
        assert!(matches!(config.validate(), Err(ConfigError::MissingTopics)));

        let config = config_from(&[("DISTRIBUTION_STRATEGY", "round_robin")]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownStrategy(name)) if name == "round_robin"
        ));
    }

    #[test]
    fn test_client_configs() {
        let config = config_from(&[
            ("KAFKA_HOSTS", "kafka:9092"),
            ("KAFKA_STATISTICS_INTERVAL_MS", "1000"),
            ("KAFKA_SESSION_TIMEOUT_MS", "30000"),
        ]);

        let consumer = config.consumer_client_config("ingest");
        assert_eq!(consumer.get("bootstrap.servers"), Some("kafka:9092"));
        assert_eq!(consumer.get("group.id"), Some("kafka-worker-pool"));
        assert_eq!(consumer.get("client.id"), Some("ingest"));
        assert_eq!(consumer.get("statistics.interval.ms"), Some("1000"));
        assert_eq!(consumer.get("session.timeout.ms"), Some("30000"));
        assert_eq!(consumer.get("max.poll.interval.ms"), Some("300000"));

        let producer = config.producer_client_config();
        assert_eq!(producer.get("compression.codec"), Some("snappy"));
        assert_eq!(producer.get("linger.ms"), Some("20"));
    }
}
