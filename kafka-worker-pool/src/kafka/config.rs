use rdkafka::ClientConfig;

/// Kafka consumer configuration builder with defaults for worker-pool consumers.
///
/// The engine tracks and commits offsets itself, so librdkafka's own offset
/// store and auto commit are always disabled. Everything else can be
/// overridden with the `with_*` methods or `set`.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    /// Sets: enable.auto.offset.store=false, enable.auto.commit=false,
    /// socket.timeout.ms, session.timeout.ms, heartbeat.interval.ms,
    /// max.poll.interval.ms.
    pub fn new(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id);

        config
            .set("enable.auto.offset.store", "false")
            .set("enable.auto.commit", "false")
            .set("socket.timeout.ms", "10000")
            .set("session.timeout.ms", "60000")
            .set("heartbeat.interval.ms", "5000")
            .set("max.poll.interval.ms", "300000");

        Self { config }
    }

    /// Enable TLS/SSL for Kafka connection
    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    pub fn with_offset_reset(mut self, policy: &str) -> Self {
        self.config.set("auto.offset.reset", policy);
        self
    }

    /// Emit raw librdkafka statistics at this interval. Zero disables them.
    pub fn with_statistics_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("statistics.interval.ms", ms.to_string());
        self
    }

    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Add any custom configuration
    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

/// Kafka producer configuration builder.
///
/// Mirrors the settings our services tune on every producer: batching linger,
/// delivery timeout, compression and the local queue bounds.
pub struct ProducerConfigBuilder {
    config: ClientConfig,
}

impl ProducerConfigBuilder {
    pub fn new(bootstrap_servers: &str) -> Self {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("partitioner", "murmur2_random");

        Self { config }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_client_id(mut self, client_id: &str) -> Self {
        self.config.set("client.id", client_id);
        self
    }

    pub fn with_linger_ms(mut self, ms: u32) -> Self {
        self.config.set("linger.ms", ms.to_string());
        self
    }

    pub fn with_message_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("message.timeout.ms", ms.to_string());
        self
    }

    pub fn with_compression_codec(mut self, codec: &str) -> Self {
        self.config.set("compression.codec", codec);
        self
    }

    /// Local queue bounds: total size in MiB and message count
    pub fn with_queue_limits(mut self, max_mib: u32, max_messages: u32) -> Self {
        self.config
            .set("queue.buffering.max.kbytes", (max_mib * 1024).to_string())
            .set("queue.buffering.max.messages", max_messages.to_string());
        self
    }

    pub fn with_statistics_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("statistics.interval.ms", ms.to_string());
        self
    }

    pub fn set(mut self, key: &str, value: &str) -> Self {
        self.config.set(key, value);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
