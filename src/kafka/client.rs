//! Broker 客户端边界
//!
//! [`GroupClient`] 抽象消费者组客户端：一次 `consume` 调用对应一个再均衡周期，
//! 期间为每个分配到的分区交付一个 [`PartitionClaim`]。具体传输由
//! `rdkafka_client`（`kafka` feature）或测试中的模拟实现提供。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// 一条消费到的消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub value: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl ConsumerRecord {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, value: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            value: value.into(),
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// 按 UTF-8 解释消息体，非法字节替换为 U+FFFD
    pub fn value_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.value)
    }
}

/// 一个再均衡周期内的消费会话
pub trait GroupSession: Send + Sync {
    fn member_id(&self) -> &str;

    fn generation_id(&self) -> i32;

    /// 会话上下文，再均衡或停机时被取消
    fn context(&self) -> &CancellationToken;

    /// 提交该消息的 offset
    fn mark_record(&self, record: &ConsumerRecord);
}

/// 一个分区在当前会话中的消息流
#[derive(Debug)]
pub struct PartitionClaim {
    topic: String,
    partition: i32,
    initial_offset: i64,
    messages: mpsc::Receiver<ConsumerRecord>,
}

impl PartitionClaim {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        initial_offset: i64,
        messages: mpsc::Receiver<ConsumerRecord>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            initial_offset,
            messages,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn initial_offset(&self) -> i64 {
        self.initial_offset
    }

    /// 下一条消息；通道关闭时返回 `None`
    pub async fn recv(&mut self) -> Option<ConsumerRecord> {
        self.messages.recv().await
    }
}

/// 会话回调
///
/// `setup` 在分区分配完成、开始交付之前调用；`consume_claim` 每个分区各调用一次，
/// 必须在会话上下文取消后尽快返回；所有 claim 返回后调用 `cleanup`。
#[async_trait]
pub trait ConsumerGroupHandler: Send + Sync {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> crate::error::Result<()>;

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> crate::error::Result<()>;

    async fn consume_claim(
        &self,
        session: Arc<dyn GroupSession>,
        claim: PartitionClaim,
    ) -> crate::error::Result<()>;
}

/// 客户端错误
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("consumer group client is closed")]
    Closed,

    #[error("broker error: {0}")]
    Broker(String),
}

/// 消费者组客户端
#[async_trait]
pub trait GroupClient: Send + Sync {
    /// 加入消费者组并运行一个会话，直到再均衡发生或 `shutdown` 被取消
    async fn consume(
        &self,
        topics: &[String],
        shutdown: &CancellationToken,
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> Result<(), ClientError>;

    /// 暂停所有已分配分区的拉取，不离开消费者组
    fn pause_all(&self);

    fn resume_all(&self);

    /// 提交剩余 offset 并离开消费者组
    async fn close(&self) -> Result<(), ClientError>;
}
