//! 基于 librdkafka 的消费者组客户端
//!
//! 一个会话对应一次分区分配：再均衡回调推进代数，当前会话随之结束。
//! offset 通过 `enable.auto.offset.store=false` + 显式存储实现"先提交后处理"，
//! 由后台自动提交刷到 broker。
//!
//! 拉取到 claim 缓冲中但会话结束时仍未分发的消息不会丢失：会话退出前把对应分区
//! 的拉取位置回退到第一条未分发的 offset。

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::Message;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::client::{
    ClientError, ConsumerGroupHandler, ConsumerRecord, GroupClient, GroupSession, PartitionClaim,
};
use super::config::ConsumerGroupConfig;
use crate::error::{Result, UranusError};

/// 每个分区 claim 的缓冲消息数
const CLAIM_BUFFER: usize = 256;

/// 连接时拉取元数据的超时
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// 会话结束时回退拉取位置的超时
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

type GroupConsumer = StreamConsumer<GroupContext>;

/// 再均衡回调上下文
pub struct GroupContext {
    generation: watch::Sender<u64>,
    paused: Arc<AtomicBool>,
}

impl ClientContext for GroupContext {}

impl ConsumerContext for GroupContext {
    fn pre_rebalance(&self, _consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        if let Rebalance::Revoke(partitions) = rebalance {
            info!(partitions = partitions.count(), "partitions revoked");
            self.generation.send_modify(|generation| *generation += 1);
        }
    }

    fn post_rebalance(&self, consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(partitions) => {
                info!(partitions = partitions.count(), "partitions assigned");
                if self.paused.load(Ordering::Acquire) {
                    if let Err(e) = consumer.pause(partitions) {
                        warn!(error = %e, "failed to pause newly assigned partitions");
                    }
                }
                self.generation.send_modify(|generation| *generation += 1);
            }
            Rebalance::Revoke(_) => {}
            Rebalance::Error(e) => warn!(error = %e, "rebalance error"),
        }
    }
}

/// librdkafka 消费者组客户端
pub struct RdKafkaGroupClient {
    consumer: Arc<GroupConsumer>,
    member_id: String,
    generation: watch::Receiver<u64>,
    paused: Arc<AtomicBool>,
    closed: AtomicBool,
    subscribed: Mutex<Option<Vec<String>>>,
}

impl RdKafkaGroupClient {
    /// 创建消费者并确认 broker 可达，失败为启动期致命错误
    pub async fn connect(config: &ConsumerGroupConfig) -> Result<Self> {
        Self::connect_with_timeout(config, METADATA_TIMEOUT).await
    }

    /// 元数据请求在阻塞线程池上执行，不占用异步工作线程
    pub(crate) async fn connect_with_timeout(
        config: &ConsumerGroupConfig,
        metadata_timeout: Duration,
    ) -> Result<Self> {
        let (generation_tx, generation) = watch::channel(0u64);
        let paused = Arc::new(AtomicBool::new(false));
        let context = GroupContext {
            generation: generation_tx,
            paused: Arc::clone(&paused),
        };
        let member_id = format!("{}-{}", config.group_id(), Uuid::new_v4());

        let consumer: GroupConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers().join(","))
            .set("group.id", config.group_id())
            .set("client.id", &member_id)
            .set("partition.assignment.strategy", config.assignor().rdkafka_strategy())
            .set("auto.offset.reset", config.initial_offset().auto_offset_reset())
            .set("enable.auto.commit", "true")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                config.session_timeout().as_millis().to_string(),
            )
            .set("security.protocol", "plaintext")
            .create_with_context(context)
            .map_err(|e| UranusError::BrokerConnection(e.to_string()))?;

        let consumer = Arc::new(consumer);
        let metadata_consumer = Arc::clone(&consumer);
        tokio::task::spawn_blocking(move || metadata_consumer.fetch_metadata(None, metadata_timeout))
            .await
            .map_err(|e| UranusError::BrokerConnection(e.to_string()))?
            .map_err(|e| UranusError::BrokerConnection(e.to_string()))?;

        info!(
            brokers = %config.brokers().join(","),
            group_id = %config.group_id(),
            assignor = %config.assignor(),
            "Kafka consumer created successfully"
        );

        Ok(Self {
            consumer,
            member_id,
            generation,
            paused,
            closed: AtomicBool::new(false),
            subscribed: Mutex::new(None),
        })
    }

    async fn ensure_subscribed(&self, topics: &[String]) -> std::result::Result<(), ClientError> {
        let mut subscribed = self.subscribed.lock().await;
        if subscribed.as_deref() == Some(topics) {
            return Ok(());
        }
        let names: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer
            .subscribe(&names)
            .map_err(|e| ClientError::Broker(e.to_string()))?;
        info!(topics = ?topics, "Successfully subscribed to Kafka topics");
        *subscribed = Some(topics.to_vec());
        Ok(())
    }

    fn has_assignment(&self) -> bool {
        self.consumer
            .assignment()
            .map(|assignment| assignment.count() > 0)
            .unwrap_or(false)
    }

    /// 把仍有未分发消息的分区拉取位置回退到第一条未分发的 offset
    ///
    /// 已被撤销的分区 seek 会失败，这些分区由新的所有者从已提交 offset 继续。
    async fn rewind_undispatched(&self, ledger: &ClaimLedger) {
        let targets = ledger.rewind_targets();
        if targets.is_empty() {
            return;
        }
        let consumer = Arc::clone(&self.consumer);
        let rewound = tokio::task::spawn_blocking(move || {
            for (topic, partition, offset) in targets {
                match consumer.seek(&topic, partition, Offset::Offset(offset), SEEK_TIMEOUT) {
                    Ok(()) => debug!(topic = %topic, partition, offset, "rewound undispatched messages"),
                    Err(e) => debug!(
                        topic = %topic,
                        partition,
                        offset,
                        error = %e,
                        "failed to rewind partition, it may have been revoked"
                    ),
                }
            }
        })
        .await;
        if let Err(e) = rewound {
            warn!(error = %e, "partition rewind task failed");
        }
    }

    fn with_assignment(&self, action: &str, apply: impl FnOnce(&TopicPartitionList) -> rdkafka::error::KafkaResult<()>) {
        match self.consumer.assignment() {
            Ok(assignment) => {
                if let Err(e) = apply(&assignment) {
                    warn!(error = %e, action, "failed to update partition assignment");
                }
            }
            Err(e) => warn!(error = %e, action, "failed to read partition assignment"),
        }
    }
}

/// 单个分区在一个会话内的拉取与分发进度
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PartitionProgress {
    /// 最后一条从 broker 取出的 offset
    fetched: i64,
    /// 下一条尚未分发的 offset
    next: i64,
}

/// 记录每个分区取出与分发到哪里，用于会话结束时回退未分发的消息
#[derive(Debug, Default)]
struct ClaimLedger {
    partitions: StdMutex<HashMap<(String, i32), PartitionProgress>>,
}

impl ClaimLedger {
    fn fetched(&self, record: &ConsumerRecord) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        partitions
            .entry((record.topic.clone(), record.partition))
            .and_modify(|progress| progress.fetched = progress.fetched.max(record.offset))
            .or_insert(PartitionProgress {
                fetched: record.offset,
                next: record.offset,
            });
    }

    fn dispatched(&self, record: &ConsumerRecord) {
        let mut partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(progress) = partitions.get_mut(&(record.topic.clone(), record.partition)) {
            progress.next = progress.next.max(record.offset + 1);
        }
    }

    /// 仍有已取出但未分发消息的分区，以及应回退到的 offset
    fn rewind_targets(&self) -> Vec<(String, i32, i64)> {
        let partitions = self.partitions.lock().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<_> = partitions
            .iter()
            .filter(|(_, progress)| progress.next <= progress.fetched)
            .map(|((topic, partition), progress)| (topic.clone(), *partition, progress.next))
            .collect();
        targets.sort();
        targets
    }
}

struct RdKafkaSession {
    consumer: Arc<GroupConsumer>,
    member_id: String,
    generation_id: i32,
    ctx: CancellationToken,
    ledger: Arc<ClaimLedger>,
}

impl GroupSession for RdKafkaSession {
    fn member_id(&self) -> &str {
        &self.member_id
    }

    fn generation_id(&self) -> i32 {
        self.generation_id
    }

    fn context(&self) -> &CancellationToken {
        &self.ctx
    }

    fn mark_record(&self, record: &ConsumerRecord) {
        self.ledger.dispatched(record);
        let mut offsets = TopicPartitionList::new();
        let stored = offsets
            .add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .and_then(|_| self.consumer.store_offsets(&offsets));
        if let Err(e) = stored {
            warn!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                error = %e,
                "failed to store offset"
            );
        }
    }
}

fn to_record<M: Message>(message: &M) -> ConsumerRecord {
    ConsumerRecord {
        topic: message.topic().to_owned(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}

fn handler_failure(stage: &str, e: UranusError) -> ClientError {
    ClientError::Broker(format!("session {stage} failed: {e}"))
}

#[async_trait]
impl GroupClient for RdKafkaGroupClient {
    async fn consume(
        &self,
        topics: &[String],
        shutdown: &CancellationToken,
        handler: Arc<dyn ConsumerGroupHandler>,
    ) -> std::result::Result<(), ClientError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        self.ensure_subscribed(topics).await?;

        let mut generation = self.generation.clone();
        let generation_id = *generation.borrow_and_update();
        let ctx = shutdown.child_token();
        let ledger = Arc::new(ClaimLedger::default());
        let session: Arc<dyn GroupSession> = Arc::new(RdKafkaSession {
            consumer: Arc::clone(&self.consumer),
            member_id: self.member_id.clone(),
            generation_id: i32::try_from(generation_id).unwrap_or(i32::MAX),
            ctx: ctx.clone(),
            ledger: Arc::clone(&ledger),
        });

        let mut claims: HashMap<(String, i32), mpsc::Sender<ConsumerRecord>> = HashMap::new();
        let mut claim_tasks = JoinSet::new();
        let mut set_up = false;

        if self.has_assignment() {
            handler
                .setup(Arc::clone(&session))
                .await
                .map_err(|e| handler_failure("setup", e))?;
            set_up = true;
        }

        loop {
            tokio::select! {
                _ = ctx.cancelled() => break,
                changed = generation.changed() => {
                    if changed.is_err() || set_up {
                        debug!(generation_id, "session generation ended");
                        break;
                    }
                    if self.has_assignment() {
                        handler
                            .setup(Arc::clone(&session))
                            .await
                            .map_err(|e| handler_failure("setup", e))?;
                        set_up = true;
                    }
                }
                received = async { self.consumer.recv().await.map(|message| to_record(&message)) } => {
                    let record = match received {
                        Ok(record) => record,
                        Err(e) => {
                            warn!(error = %e, "kafka receive error");
                            continue;
                        }
                    };
                    ledger.fetched(&record);
                    if !set_up {
                        handler
                            .setup(Arc::clone(&session))
                            .await
                            .map_err(|e| handler_failure("setup", e))?;
                        set_up = true;
                    }

                    let sender = claims
                        .entry((record.topic.clone(), record.partition))
                        .or_insert_with(|| {
                            let (tx, rx) = mpsc::channel(CLAIM_BUFFER);
                            let claim = PartitionClaim::new(
                                record.topic.clone(),
                                record.partition,
                                record.offset,
                                rx,
                            );
                            let handler = Arc::clone(&handler);
                            let session = Arc::clone(&session);
                            claim_tasks.spawn(async move { handler.consume_claim(session, claim).await });
                            tx
                        });

                    tokio::select! {
                        sent = sender.send(record) => {
                            if sent.is_err() {
                                debug!("partition claim finished before delivery");
                            }
                        }
                        _ = ctx.cancelled() => break,
                    }
                }
            }
        }

        ctx.cancel();
        drop(claims);
        while let Some(joined) = claim_tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "partition claim failed"),
                Err(e) => error!(error = %e, "partition claim task aborted"),
            }
        }
        self.rewind_undispatched(&ledger).await;

        if set_up {
            handler
                .cleanup(session)
                .await
                .map_err(|e| handler_failure("cleanup", e))?;
        }
        Ok(())
    }

    fn pause_all(&self) {
        self.paused.store(true, Ordering::Release);
        self.with_assignment("pause", |assignment| self.consumer.pause(assignment));
    }

    fn resume_all(&self) {
        self.paused.store(false, Ordering::Release);
        self.with_assignment("resume", |assignment| self.consumer.resume(assignment));
    }

    async fn close(&self) -> std::result::Result<(), ClientError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ClientError::Closed);
        }

        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) | Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => {}
            Err(e) => return Err(ClientError::Broker(e.to_string())),
        }
        self.consumer.unsubscribe();
        info!(member_id = %self.member_id, "Kafka consumer closed");
        Ok(())
    }
}
