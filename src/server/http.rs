//! HTTP 监听器
//!
//! 基于 axum。健康检查路由读取原子标记：服务中返回 200 `{"status":"ok"}`，
//! 否则返回 503 `{"status":"not ok"}`。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::Json;
use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{Instrument, Span, info, info_span};

use super::{ListenerLifecycle, ListenerState, ManagedListener};
use crate::error::{Protocol, Result, UranusError};
use crate::health::HealthFlag;
use crate::interceptor::{HttpMiddleware, apply_middlewares};

/// HTTP 监听器构建器
pub struct HttpServerBuilder {
    port: u16,
    app_name: String,
    span: Option<Span>,
    middlewares: Vec<Arc<dyn HttpMiddleware>>,
}

impl HttpServerBuilder {
    pub fn new(port: u16, app_name: impl Into<String>) -> Self {
        Self {
            port,
            app_name: app_name.into(),
            span: None,
            middlewares: Vec::new(),
        }
    }

    /// 追加一个中间件，先追加的先看到请求
    pub fn middleware(mut self, middleware: impl HttpMiddleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    pub fn build(self) -> HttpServer {
        let span = self
            .span
            .unwrap_or_else(|| info_span!("http_server", app_name = %self.app_name));

        HttpServer {
            port: self.port,
            app_name: self.app_name,
            span,
            middlewares: self.middlewares,
            router: Mutex::new(Some(Router::new())),
            health: HealthFlag::new(),
            lifecycle: ListenerLifecycle::new(),
        }
    }
}

/// HTTP 监听器
pub struct HttpServer {
    port: u16,
    app_name: String,
    span: Span,
    middlewares: Vec<Arc<dyn HttpMiddleware>>,
    router: Mutex<Option<Router>>,
    health: HealthFlag,
    lifecycle: ListenerLifecycle,
}

impl HttpServer {
    pub fn builder(port: u16, app_name: impl Into<String>) -> HttpServerBuilder {
        HttpServerBuilder::new(port, app_name)
    }

    /// 在 `path` 上挂载健康检查路由
    pub fn health_check(self, path: &str) -> Self {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        let health = self.health.clone();

        self.register_router(move |router| {
            router.route(
                &path,
                get(move || {
                    let health = health.clone();
                    async move {
                        if health.is_serving() {
                            (StatusCode::OK, Json(json!({ "status": "ok" })))
                        } else {
                            (
                                StatusCode::SERVICE_UNAVAILABLE,
                                Json(json!({ "status": "not ok" })),
                            )
                        }
                    }
                }),
            )
        })
    }

    /// 在启动前挂载业务路由
    pub fn register_router(mut self, register_fn: impl FnOnce(Router) -> Router) -> Self {
        let slot = self.router.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(router) = slot.take() {
            *slot = Some(register_fn(router));
        }
        self
    }

    /// 切换健康状态，返回之前的状态；停机开始后不再恢复为可用
    pub fn switch_health_check(&self, serving: bool) -> bool {
        self.health.set_serving(serving)
    }

    pub fn health(&self) -> &HealthFlag {
        &self.health
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.state()
    }

    /// 关闭监听器，`deadline` 内进行中的请求未完成则返回错误
    pub async fn shutdown(&self, deadline: Duration) -> Result<()> {
        tokio::time::timeout(deadline, self.lifecycle.stop_and_wait())
            .await
            .map_err(|_| {
                UranusError::HttpShutdown(format!(
                    "in-flight requests still running after {}s",
                    deadline.as_secs_f64()
                ))
            })
    }

    async fn serve(&self) -> Result<()> {
        let router = self
            .router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| UranusError::serve(Protocol::Http, "listener already started"))?;
        let app = apply_middlewares(router, &self.middlewares);

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| UranusError::Bind {
                protocol: Protocol::Http,
                port: self.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        if self.lifecycle.is_shutdown_requested() {
            info!(app_name = %self.app_name, "http listener stopped before serving");
            self.lifecycle.mark_stopped();
            return Ok(());
        }
        self.lifecycle.mark_serving(local_addr);
        self.switch_health_check(true);
        info!(app_name = %self.app_name, port = local_addr.port(), "http listen on port");

        let result = axum::serve(listener, app)
            .with_graceful_shutdown(self.lifecycle.shutdown_signal())
            .await;

        self.lifecycle.mark_stopped();
        result.map_err(|e| UranusError::serve(Protocol::Http, e))
    }
}

#[async_trait]
impl ManagedListener for HttpServer {
    fn protocol(&self) -> Protocol {
        Protocol::Http
    }

    fn app_name(&self) -> &str {
        &self.app_name
    }

    async fn start_listening(&self) -> Result<()> {
        let span = self.span.clone();
        self.serve().instrument(span).await
    }

    async fn switch_health(&self, serving: bool) -> bool {
        if serving {
            self.switch_health_check(true)
        } else {
            self.health.drain()
        }
    }

    async fn stop(&self, deadline: Duration) -> Result<()> {
        self.shutdown(deadline).await
    }
}
