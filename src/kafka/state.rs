//! 消费者状态机与就绪门

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

/// 消费者生命周期状态
///
/// `Initializing → AwaitingSession → Ready ⇄ Consuming ⇄ Rebalancing → Draining → Closed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Initializing,
    AwaitingSession,
    Ready,
    Consuming,
    Rebalancing,
    Draining,
    Closed,
}

impl ConsumerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumerState::Initializing => "initializing",
            ConsumerState::AwaitingSession => "awaiting_session",
            ConsumerState::Ready => "ready",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Rebalancing => "rebalancing",
            ConsumerState::Draining => "draining",
            ConsumerState::Closed => "closed",
        }
    }

    /// 是否允许从当前状态迁移到 `next`；不允许重复进入当前状态
    pub fn can_advance_to(&self, next: ConsumerState) -> bool {
        use ConsumerState::*;
        matches!(
            (self, next),
            (Initializing, AwaitingSession | Draining)
                | (AwaitingSession, Ready | Rebalancing | Draining)
                | (Ready, Consuming | Rebalancing | Draining)
                | (Consuming, Ready | Rebalancing | Draining)
                | (Rebalancing, AwaitingSession | Draining)
                | (Draining, Closed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Closed)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 可观察的状态机
#[derive(Debug, Clone)]
pub(crate) struct StateMachine {
    tx: Arc<watch::Sender<ConsumerState>>,
}

impl StateMachine {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(ConsumerState::Initializing);
        Self { tx: Arc::new(tx) }
    }

    /// 尝试迁移，非法迁移被忽略并返回 false
    pub(crate) fn advance(&self, next: ConsumerState) -> bool {
        let mut from = next;
        let moved = self.tx.send_if_modified(|state| {
            from = *state;
            if state.can_advance_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });
        if moved {
            debug!(from = %from, to = %next, "consumer state changed");
        }
        moved
    }

    pub(crate) fn current(&self) -> ConsumerState {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ConsumerState> {
        self.tx.subscribe()
    }
}

/// 一次性就绪门，第一个会话建立时关闭，之后不再打开
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    closed: Arc<watch::Sender<bool>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            closed: Arc::new(closed),
        }
    }

    /// 关闭就绪门，只有真正完成关闭的那次调用返回 true
    pub fn close(&self) -> bool {
        self.closed.send_if_modified(|closed| {
            if *closed {
                false
            } else {
                *closed = true;
                true
            }
        })
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// 等待就绪门关闭
    pub async fn wait(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}
