//! Kafka 生产者

use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, info};

use crate::error::{Result, UranusError};

/// 消息生产者
#[async_trait]
pub trait MessageProducer: Send + Sync {
    /// 发送一条消息，返回写入的分区与 offset
    async fn send(&self, topic: &str, key: &str, data: &[u8]) -> Result<(i32, i64)>;
}

/// 生产者配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub brokers: Vec<String>,
    /// 消息超时（默认 5 秒）
    pub message_timeout: Duration,
    /// 启用幂等时强制 `acks=all`（默认开启）
    pub enable_idempotence: bool,
    /// 压缩类型：none、gzip、snappy、lz4、zstd（默认 snappy）
    pub compression_type: String,
    /// 批量发送延迟（默认 10ms）
    pub linger: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
}

impl ProducerConfig {
    pub fn new<B>(brokers: B) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
    {
        Self {
            brokers: brokers.into_iter().map(Into::into).collect(),
            message_timeout: Duration::from_secs(5),
            enable_idempotence: true,
            compression_type: "snappy".to_string(),
            linger: Duration::from_millis(10),
            retries: 3,
            retry_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_idempotence(mut self, enable: bool) -> Self {
        self.enable_idempotence = enable;
        self
    }

    pub fn with_compression(mut self, compression: impl Into<String>) -> Self {
        self.compression_type = compression.into();
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", self.brokers.join(","))
            .set("message.timeout.ms", self.message_timeout.as_millis().to_string())
            .set("enable.idempotence", self.enable_idempotence.to_string())
            .set("compression.type", &self.compression_type)
            .set("linger.ms", self.linger.as_millis().to_string())
            .set("retries", self.retries.to_string())
            .set("retry.backoff.ms", self.retry_backoff.as_millis().to_string())
            .set("security.protocol", "plaintext");
        if self.enable_idempotence {
            config.set("acks", "all");
        }
        config
    }
}

/// 基于 rdkafka `FutureProducer` 的生产者
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &ProducerConfig) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(UranusError::invalid_config(
                "producer requires at least one broker",
            ));
        }
        let producer: FutureProducer = config
            .client_config()
            .create()
            .map_err(|e| UranusError::BrokerConnection(e.to_string()))?;

        info!(
            bootstrap = %config.brokers.join(","),
            timeout_ms = config.message_timeout.as_millis() as u64,
            idempotence = config.enable_idempotence,
            compression = %config.compression_type,
            "Kafka producer created successfully"
        );

        Ok(Self {
            producer,
            timeout: config.message_timeout,
        })
    }
}

#[async_trait]
impl MessageProducer for KafkaProducer {
    async fn send(&self, topic: &str, key: &str, data: &[u8]) -> Result<(i32, i64)> {
        let record = FutureRecord::to(topic).key(key).payload(data);
        let delivery = self
            .producer
            .send(record, self.timeout)
            .await
            .map_err(|(e, _)| UranusError::BrokerConnection(e.to_string()))?;
        debug!(
            topic,
            partition = delivery.partition,
            offset = delivery.offset,
            "message delivered"
        );
        Ok((delivery.partition, delivery.offset))
    }
}
