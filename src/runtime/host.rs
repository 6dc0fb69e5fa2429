//! 双协议服务宿主
//!
//! 在同一进程内启动 gRPC 与 HTTP 两个监听器（以及可选的后台任务），
//! 收到终止信号后按固定顺序停机：
//!
//! 1. 两个监听器的健康状态立即置为不可用
//! 2. 等待 `drain_wait`，让负载均衡观察到健康状态变化
//! 3. 并发关闭两个监听器并取消后台任务；关闭出错时额外等待 `hard_stop_wait`
//! 4. 全部完成后返回
//!
//! 启动阶段任一监听器绑定失败都会让 [`ServiceHost::run`] 立即返回致命错误。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::config::ShutdownPolicy;
use super::signal::TerminationListener;
use super::task::{Task, TaskResult};
use crate::error::{Protocol, Result, UranusError};
use crate::server::{HttpServer, ManagedListener, RpcServer};

/// 服务宿主构建器
#[derive(Default)]
pub struct ServiceHostBuilder {
    grpc: Option<Arc<dyn ManagedListener>>,
    http: Option<Arc<dyn ManagedListener>>,
    tasks: Vec<Box<dyn Task>>,
    policy: ShutdownPolicy,
}

impl ServiceHostBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_grpc_server(self, server: RpcServer) -> Self {
        self.with_grpc_listener(Arc::new(server))
    }

    /// 使用已共享的监听器，便于调用方保留引用查询 `local_addr`
    pub fn with_grpc_listener(mut self, listener: Arc<dyn ManagedListener>) -> Self {
        self.grpc = Some(listener);
        self
    }

    pub fn with_http_server(self, server: HttpServer) -> Self {
        self.with_http_listener(Arc::new(server))
    }

    pub fn with_http_listener(mut self, listener: Arc<dyn ManagedListener>) -> Self {
        self.http = Some(listener);
        self
    }

    pub fn with_graceful_shutdown(mut self, policy: ShutdownPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// 添加与监听器一起运行的后台任务
    pub fn with_task(mut self, task: Box<dyn Task>) -> Self {
        info!(task_name = %task.name(), "Adding task to service host");
        self.tasks.push(task);
        self
    }

    pub fn build(self) -> ServiceHost {
        ServiceHost {
            grpc: self.grpc,
            http: self.http,
            tasks: self.tasks,
            policy: self.policy,
        }
    }
}

/// 双协议服务宿主，构建后不可再修改
pub struct ServiceHost {
    grpc: Option<Arc<dyn ManagedListener>>,
    http: Option<Arc<dyn ManagedListener>>,
    tasks: Vec<Box<dyn Task>>,
    policy: ShutdownPolicy,
}

impl ServiceHost {
    pub fn builder() -> ServiceHostBuilder {
        ServiceHostBuilder::new()
    }

    pub fn policy(&self) -> &ShutdownPolicy {
        &self.policy
    }

    /// 运行直到收到配置的终止信号，然后执行停机流程
    ///
    /// 信号监听在监听器启动之前注册。
    pub async fn run(self) -> Result<()> {
        let mut signals = TerminationListener::install(&self.policy.signals)?;
        self.run_until(async move {
            signals.recv().await;
        })
        .await
    }

    /// 运行直到 `shutdown` 完成，然后执行停机流程
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let ServiceHost {
            grpc,
            http,
            tasks,
            policy,
        } = self;

        if !policy.delay.is_zero() {
            warn!(
                delay_secs = policy.delay.as_secs_f64(),
                "shutdown delay is configured but not used by the shutdown sequence"
            );
        }

        let listeners: Vec<Arc<dyn ManagedListener>> = grpc.into_iter().chain(http).collect();

        let mut serving = JoinSet::new();
        let mut serving_ids: HashMap<Id, Protocol> = HashMap::new();
        for listener in &listeners {
            let listener = Arc::clone(listener);
            let protocol = listener.protocol();
            let handle = serving.spawn(async move { (protocol, listener.start_listening().await) });
            serving_ids.insert(handle.id(), protocol);
        }

        let task_shutdown = CancellationToken::new();
        let mut hosted = JoinSet::new();
        let mut hosted_ids: HashMap<Id, String> = HashMap::new();
        for task in tasks {
            let name = task.name().to_owned();
            let token = task_shutdown.child_token();
            info!(task_name = %name, "Starting hosted task");
            let task_name = name.clone();
            let handle = hosted.spawn(async move { (task_name, task.run(token).await) });
            hosted_ids.insert(handle.id(), name);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(joined) = serving.join_next() => match joined {
                    Ok((protocol, Err(e))) => {
                        error!(protocol = %protocol, error = %e, "listener failed");
                        return Err(e);
                    }
                    Ok((protocol, Ok(()))) => {
                        warn!(protocol = %protocol, "listener exited before shutdown");
                    }
                    Err(e) => {
                        let protocol = serving_ids.get(&e.id()).copied().unwrap_or(Protocol::Grpc);
                        error!(protocol = %protocol, error = %e, "listener task aborted");
                        return Err(UranusError::serve(protocol, e));
                    }
                },
                Some(joined) = hosted.join_next() => match joined {
                    Ok((name, Err(e))) => {
                        error!(task_name = %name, error = %e, "hosted task failed");
                        return Err(e);
                    }
                    Ok((name, Ok(()))) => info!(task_name = %name, "Hosted task completed"),
                    Err(e) => {
                        let name = hosted_ids.get(&e.id()).cloned().unwrap_or_default();
                        error!(task_name = %name, error = %e, "hosted task aborted");
                        return Err(UranusError::Task { name, reason: e.to_string() });
                    }
                },
            }
        }

        // 第一步：健康状态置为不可用
        for listener in &listeners {
            listener.switch_health(false).await;
        }

        // 第二步：等待外部基础设施摘除流量
        info!(
            drain_wait_secs = policy.drain_wait.as_secs_f64(),
            "server stopped gracefully, waiting for shutdown"
        );
        tokio::time::sleep(policy.drain_wait).await;

        // 第三步：并发关闭监听器与后台任务
        let stop_listeners = join_all(
            listeners
                .iter()
                .map(|listener| stop_listener(listener.as_ref(), &policy)),
        );
        let stop_tasks = async {
            task_shutdown.cancel();
            drain_tasks(&mut hosted, &hosted_ids, policy.shutdown_deadline).await
        };
        let (_, task_result) = tokio::join!(stop_listeners, stop_tasks);

        serving.shutdown().await;
        info!("shutdown complete");
        task_result
    }
}

async fn stop_listener(listener: &dyn ManagedListener, policy: &ShutdownPolicy) {
    let protocol = listener.protocol();
    match listener.stop(policy.shutdown_deadline).await {
        Ok(()) => {
            info!(protocol = %protocol, app_name = %listener.app_name(), "listener stopped");
        }
        Err(e) => {
            error!(
                protocol = %protocol,
                error = %e,
                hard_stop_wait_secs = policy.hard_stop_wait.as_secs_f64(),
                "listener shutdown failed, waiting before giving up"
            );
            tokio::time::sleep(policy.hard_stop_wait).await;
            info!(protocol = %protocol, app_name = %listener.app_name(), "listener stopped");
        }
    }
}

/// 等待后台任务退出，返回第一个错误；超时后放弃剩余任务
async fn drain_tasks(
    hosted: &mut JoinSet<(String, TaskResult)>,
    names: &HashMap<Id, String>,
    deadline: Duration,
) -> Result<()> {
    let drain = async {
        let mut first_error = None;
        while let Some(joined) = hosted.join_next().await {
            let failure = match joined {
                Ok((name, Ok(()))) => {
                    info!(task_name = %name, "Hosted task stopped");
                    None
                }
                Ok((name, Err(e))) => {
                    error!(task_name = %name, error = %e, phase = %e.phase(), "hosted task failed during shutdown");
                    Some(e)
                }
                Err(e) => {
                    let name = names.get(&e.id()).cloned().unwrap_or_default();
                    warn!(task_name = %name, error = %e, "hosted task join error");
                    Some(UranusError::Task {
                        name,
                        reason: e.to_string(),
                    })
                }
            };
            if first_error.is_none() {
                first_error = failure;
            }
        }
        first_error
    };

    let outcome = tokio::time::timeout(deadline, drain).await;
    match outcome {
        Ok(Some(e)) => Err(e),
        Ok(None) => Ok(()),
        Err(_) => {
            warn!(
                deadline_secs = deadline.as_secs_f64(),
                "hosted tasks did not stop before the deadline"
            );
            hosted.abort_all();
            Ok(())
        }
    }
}
