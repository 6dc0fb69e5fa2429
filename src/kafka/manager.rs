//! 消费者组生命周期管理
//!
//! [`ConsumerGroupManager`] 持续向客户端请求消费会话：每次再均衡后立即重新加入，
//! 任意时刻最多只有一个会话。每条消息先调用接收钩子，再提交 offset，最后交给
//! 对应 topic 的处理器；处理器出错只交给错误钩子，不阻塞提交也不重试。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::{
    ClientError, ConsumerGroupHandler, ConsumerRecord, GroupClient, GroupSession, PartitionClaim,
};
use super::config::ConsumerGroupConfig;
use super::state::{ConsumerState, ReadinessGate, StateMachine};
use crate::error::{Result, UranusError};
use crate::runtime::signal::{OperationalSignal, TerminationListener, TerminationSignal};
use crate::runtime::task::{Task, TaskResult};

/// 处理器错误
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// 单个 topic 的消息处理器
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, record: &ConsumerRecord) -> std::result::Result<(), HandlerError>;
}

/// 由闭包实现的处理器，见 [`handler_fn`]
pub struct FnHandler<F>(F);

/// 用闭包构建处理器，闭包接收消息的一份拷贝
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    FnHandler(f)
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(ConsumerRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle_message(&self, record: &ConsumerRecord) -> std::result::Result<(), HandlerError> {
        (self.0)(record.clone()).await
    }
}

/// 接收钩子，在提交 offset 之前调用
pub type ReceiveHook = Arc<dyn Fn(&ConsumerRecord) + Send + Sync>;

/// 错误钩子，处理器失败时调用
pub type ErrorHook = Arc<dyn Fn(&ConsumerRecord, HandlerError) + Send + Sync>;

fn default_receive_hook() -> ReceiveHook {
    Arc::new(|record: &ConsumerRecord| {
        info!(
            value = %record.value_str(),
            timestamp = ?record.timestamp,
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Message claimed"
        );
    })
}

fn default_error_hook() -> ErrorHook {
    Arc::new(|record: &ConsumerRecord, err: HandlerError| {
        warn!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            error = %err,
            "message handler failed"
        );
    })
}

/// 消费者组管理器构建器
///
/// 处理器只能在构建阶段注册，构建完成后只读。
pub struct ConsumerGroupBuilder {
    config: ConsumerGroupConfig,
    client: Arc<dyn GroupClient>,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    on_receive: Option<ReceiveHook>,
    on_error: Option<ErrorHook>,
    pause_on_user_signal: bool,
}

impl ConsumerGroupBuilder {
    pub fn new(config: ConsumerGroupConfig, client: Arc<dyn GroupClient>) -> Self {
        Self {
            config,
            client,
            handlers: HashMap::new(),
            on_receive: None,
            on_error: None,
            pause_on_user_signal: true,
        }
    }

    /// 为 topic 注册处理器，同一 topic 重复注册时后者覆盖前者
    pub fn register_handler(
        mut self,
        topic: impl Into<String>,
        handler: impl MessageHandler + 'static,
    ) -> Self {
        let topic = topic.into();
        if !self.config.subscribes_to(&topic) {
            warn!(topic = %topic, "handler registered for a topic that is not subscribed");
        }
        self.handlers.insert(topic, Arc::new(handler));
        self
    }

    pub fn on_receive(mut self, hook: impl Fn(&ConsumerRecord) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(hook));
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(&ConsumerRecord, HandlerError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// 是否监听 SIGUSR1 切换暂停状态（默认开启）
    pub fn pause_on_user_signal(mut self, enabled: bool) -> Self {
        self.pause_on_user_signal = enabled;
        self
    }

    pub fn build(self) -> ConsumerGroupManager {
        let state = StateMachine::new();
        let ready = ReadinessGate::new();
        let dispatcher = Arc::new(ClaimDispatcher {
            handlers: self.handlers,
            on_receive: self.on_receive.unwrap_or_else(default_receive_hook),
            on_error: self.on_error.unwrap_or_else(default_error_hook),
            state: state.clone(),
            ready: ready.clone(),
        });

        ConsumerGroupManager {
            config: self.config,
            client: self.client,
            dispatcher,
            paused: AtomicBool::new(false),
            pause_on_user_signal: self.pause_on_user_signal,
            state,
            ready,
            started: AtomicBool::new(false),
            sessions: AtomicU64::new(0),
        }
    }
}

/// 消费者组生命周期管理器
pub struct ConsumerGroupManager {
    config: ConsumerGroupConfig,
    client: Arc<dyn GroupClient>,
    dispatcher: Arc<ClaimDispatcher>,
    paused: AtomicBool,
    pause_on_user_signal: bool,
    state: StateMachine,
    ready: ReadinessGate,
    started: AtomicBool,
    sessions: AtomicU64,
}

impl ConsumerGroupManager {
    pub fn builder(config: ConsumerGroupConfig, client: Arc<dyn GroupClient>) -> ConsumerGroupBuilder {
        ConsumerGroupBuilder::new(config, client)
    }

    pub fn config(&self) -> &ConsumerGroupConfig {
        &self.config
    }

    pub fn state(&self) -> ConsumerState {
        self.state.current()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    /// 第一个会话建立时关闭的就绪门
    pub fn ready(&self) -> ReadinessGate {
        self.ready.clone()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 已请求的会话数
    pub fn sessions_requested(&self) -> u64 {
        self.sessions.load(Ordering::Acquire)
    }

    /// 切换暂停状态，返回切换后是否处于暂停
    ///
    /// 暂停只停止拉取，不离开消费者组。
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.paused.fetch_xor(true, Ordering::AcqRel);
        if paused {
            self.client.pause_all();
            info!(group_id = %self.config.group_id(), "Pausing consumption");
        } else {
            self.client.resume_all();
            info!(group_id = %self.config.group_id(), "Resuming consumption");
        }
        paused
    }

    /// 运行消费循环直到 `shutdown` 被取消，然后关闭客户端
    ///
    /// 每个管理器只能运行一次。会话出错或客户端关闭失败时返回致命错误。
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(UranusError::invalid_config(
                "consumer group manager can only run once",
            ));
        }

        let mut pause_signal = if self.pause_on_user_signal {
            Some(OperationalSignal::user_defined()?)
        } else {
            None
        };

        info!(
            group_id = %self.config.group_id(),
            topics = ?self.config.topics(),
            assignor = %self.config.assignor(),
            "Starting consumer group"
        );

        let ctx = shutdown.child_token();
        let consume = self.consume_loop(&ctx);
        tokio::pin!(consume);

        let mut loop_result = None;
        let mut announced = false;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    info!("terminating: context cancelled");
                    break;
                }
                result = &mut consume => {
                    loop_result = Some(result);
                    break;
                }
                _ = self.ready.wait(), if !announced => {
                    announced = true;
                    info!(group_id = %self.config.group_id(), "consumer up and running");
                }
                _ = next_pause_signal(&mut pause_signal) => {
                    self.toggle_pause();
                }
            }
        }

        self.state.advance(ConsumerState::Draining);
        ctx.cancel();
        let loop_result = match loop_result {
            Some(result) => result,
            None => consume.await,
        };

        let close_result = self.client.close().await;
        self.state.advance(ConsumerState::Closed);

        match (loop_result, close_result) {
            (loop_result, Err(e)) => {
                if let Err(loop_err) = loop_result {
                    error!(error = %loop_err, "consume loop failed before close");
                }
                error!(error = %e, "Error closing client");
                Err(UranusError::ClientClose(e.to_string()))
            }
            (Err(e), Ok(())) => Err(e),
            (Ok(()), Ok(())) => {
                info!(group_id = %self.config.group_id(), "consumer group closed");
                Ok(())
            }
        }
    }

    /// 运行直到收到任一终止信号
    pub async fn run_until_signal(&self, signals: &[TerminationSignal]) -> Result<()> {
        let mut listener = TerminationListener::install(signals)?;
        let shutdown = CancellationToken::new();
        let run = self.run(shutdown.clone());
        tokio::pin!(run);

        tokio::select! {
            result = &mut run => result,
            _ = listener.recv() => {
                info!("terminating: via signal");
                shutdown.cancel();
                run.await
            }
        }
    }

    /// 顺序请求会话：上一个会话完全返回后才请求下一个
    async fn consume_loop(&self, ctx: &CancellationToken) -> Result<()> {
        let topics = self.config.topics().to_vec();
        let handler: Arc<dyn ConsumerGroupHandler> = self.dispatcher.clone();

        loop {
            if ctx.is_cancelled() {
                return Ok(());
            }
            self.state.advance(ConsumerState::AwaitingSession);
            let session = self.sessions.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(session, "requesting consumer group session");

            match self.client.consume(&topics, ctx, Arc::clone(&handler)).await {
                Ok(()) => {}
                Err(ClientError::Closed) => {
                    info!("consumer group client closed, leaving consume loop");
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Error from consumer");
                    return Err(UranusError::Session(e.to_string()));
                }
            }

            if ctx.is_cancelled() {
                return Ok(());
            }
            self.state.advance(ConsumerState::Rebalancing);
            info!(group_id = %self.config.group_id(), "consumer group rebalanced, rejoining");
        }
    }
}

async fn next_pause_signal(signal: &mut Option<OperationalSignal>) {
    match signal {
        Some(signal) => signal.recv().await,
        None => std::future::pending().await,
    }
}

impl Task for Arc<ConsumerGroupManager> {
    fn name(&self) -> &str {
        self.config.group_id()
    }

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> std::pin::Pin<Box<dyn Future<Output = TaskResult> + Send>> {
        Box::pin(async move { ConsumerGroupManager::run(&self, shutdown).await })
    }
}

/// 会话回调实现：就绪门、状态推进与按 topic 分发
struct ClaimDispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    on_receive: ReceiveHook,
    on_error: ErrorHook,
    state: StateMachine,
    ready: ReadinessGate,
}

impl ClaimDispatcher {
    async fn dispatch(&self, session: &dyn GroupSession, ctx: &CancellationToken, record: ConsumerRecord) {
        (self.on_receive)(&record);
        session.mark_record(&record);

        let Some(handler) = self.handlers.get(&record.topic) else {
            return;
        };

        tokio::select! {
            biased;
            result = handler.handle_message(&record) => {
                if let Err(e) = result {
                    (self.on_error)(&record, e);
                }
            }
            _ = ctx.cancelled() => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "handler interrupted by session end"
                );
            }
        }
    }
}

#[async_trait]
impl ConsumerGroupHandler for ClaimDispatcher {
    async fn setup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        if self.ready.close() {
            info!(
                member_id = %session.member_id(),
                generation_id = session.generation_id(),
                "first consumer group session established"
            );
        }
        self.state.advance(ConsumerState::Ready);
        Ok(())
    }

    async fn cleanup(&self, session: Arc<dyn GroupSession>) -> Result<()> {
        debug!(generation_id = session.generation_id(), "consumer group session ended");
        Ok(())
    }

    async fn consume_claim(&self, session: Arc<dyn GroupSession>, mut claim: PartitionClaim) -> Result<()> {
        self.state.advance(ConsumerState::Consuming);
        let ctx = session.context().clone();
        debug!(
            topic = %claim.topic(),
            partition = claim.partition(),
            initial_offset = claim.initial_offset(),
            "partition claim started"
        );

        loop {
            let record = tokio::select! {
                biased;
                _ = ctx.cancelled() => return Ok(()),
                record = claim.recv() => match record {
                    Some(record) => record,
                    None => {
                        info!(topic = %claim.topic(), partition = claim.partition(), "message channel was closed");
                        return Ok(());
                    }
                },
            };
            self.dispatch(session.as_ref(), &ctx, record).await;
        }
    }
}
