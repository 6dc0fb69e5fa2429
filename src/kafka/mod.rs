//! Kafka 消费者组与生产者
//!
//! 消费者组的生命周期管理与 broker 客户端解耦：[`ConsumerGroupManager`] 只依赖
//! [`GroupClient`]。基于 librdkafka 的实现与生产者需要启用 `kafka` feature。

pub mod client;
pub mod config;
pub mod manager;
pub mod state;

#[cfg(feature = "kafka")]
pub mod producer;
#[cfg(feature = "kafka")]
pub mod rdkafka_client;

pub use client::{
    ClientError, ConsumerGroupHandler, ConsumerRecord, GroupClient, GroupSession, PartitionClaim,
};
pub use config::{Assignor, ConsumerGroupConfig, InitialOffset};
pub use manager::{
    ConsumerGroupBuilder, ConsumerGroupManager, ErrorHook, FnHandler, HandlerError,
    MessageHandler, ReceiveHook, handler_fn,
};
pub use state::{ConsumerState, ReadinessGate};

#[cfg(feature = "kafka")]
pub use producer::{KafkaProducer, MessageProducer, ProducerConfig};
#[cfg(feature = "kafka")]
pub use rdkafka_client::RdKafkaGroupClient;
