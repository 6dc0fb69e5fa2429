//! 监听器模块
//!
//! gRPC 与 HTTP 两个监听器包装各自绑定一个端口，由 [`crate::runtime::ServiceHost`]
//! 通过 [`ManagedListener`] 统一驱动：启动、切换健康状态、主动关闭。

pub mod grpc;
pub mod http;

pub use grpc::{ConnectorOption, RpcServer, RpcServerBuilder};
pub use http::{HttpServer, HttpServerBuilder};

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{Protocol, Result};

/// 由服务宿主管理的监听器
#[async_trait]
pub trait ManagedListener: Send + Sync + 'static {
    fn protocol(&self) -> Protocol;

    fn app_name(&self) -> &str;

    /// 绑定端口并持续服务，直到被 [`ManagedListener::stop`] 关闭
    ///
    /// 绑定失败返回 [`crate::UranusError::Bind`]，调用方应视为致命错误。
    async fn start_listening(&self) -> Result<()>;

    /// 切换健康状态，返回之前的状态
    ///
    /// 切换为 `false` 表示进入停机，此后健康状态保持 NOT_SERVING，
    /// 即使监听器稍后才完成绑定。
    async fn switch_health(&self, serving: bool) -> bool;

    /// 主动关闭：停止接收新请求并等待进行中的请求完成
    async fn stop(&self, deadline: Duration) -> Result<()>;
}

/// 监听器运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Serving,
    Stopped,
}

/// 两个监听器共用的启停协调
pub(crate) struct ListenerLifecycle {
    shutdown: CancellationToken,
    state: watch::Sender<ListenerState>,
    local_addr: OnceLock<SocketAddr>,
}

impl ListenerLifecycle {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(ListenerState::Idle);
        Self {
            shutdown: CancellationToken::new(),
            state,
            local_addr: OnceLock::new(),
        }
    }

    pub(crate) fn mark_serving(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
        self.state.send_replace(ListenerState::Serving);
    }

    pub(crate) fn mark_stopped(&self) {
        self.state.send_replace(ListenerState::Stopped);
    }

    pub(crate) fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// 是否已经请求关闭
    pub(crate) fn is_shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// 传给底层传输的关闭信号
    pub(crate) fn shutdown_signal(&self) -> WaitForCancellationFutureOwned {
        self.shutdown.clone().cancelled_owned()
    }

    /// 触发关闭并等待服务循环退出；从未启动过的监听器立即返回
    pub(crate) async fn stop_and_wait(&self) {
        self.shutdown.cancel();
        let mut state = self.state.subscribe();
        if *state.borrow_and_update() == ListenerState::Idle {
            return;
        }
        let _ = state.wait_for(|s| *s == ListenerState::Stopped).await;
    }
}
