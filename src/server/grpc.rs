//! gRPC 监听器
//!
//! 按顺序应用配置项构建：端口与应用名、反射开关、日志 span、有序拦截器链，
//! 可选的 panic 恢复层包在拦截器链外层。
//! 内置健康检查服务，其状态只由宿主显式切换，默认 NOT_SERVING。

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::codegen::http;
use tonic::service::interceptor::ResponseBody;
use tonic::service::{InterceptorLayer, RoutesBuilder};
use tonic::transport::Server;
use tonic_health::ServingStatus;
use tower::util::MapResponseLayer;
use tonic_health::server::HealthReporter;
use tracing::{Instrument, Span, info, info_span};

use super::{ListenerLifecycle, ListenerState, ManagedListener};
use crate::error::{Protocol, Result, UranusError};
use crate::health::HealthFlag;
use crate::interceptor::{InterceptorChain, Recovery, RpcInterceptor, RpcRecoveryLayer};

/// 端口与应用名
#[derive(Debug, Clone)]
pub struct ConnectorOption {
    pub port: u16,
    pub app_name: String,
}

impl ConnectorOption {
    pub fn new(port: u16, app_name: impl Into<String>) -> Self {
        Self {
            port,
            app_name: app_name.into(),
        }
    }
}

/// gRPC 监听器构建器
pub struct RpcServerBuilder {
    connector: ConnectorOption,
    reflection: bool,
    descriptor_sets: Vec<&'static [u8]>,
    span: Option<Span>,
    interceptors: Vec<Arc<dyn RpcInterceptor>>,
    recovery: Option<Recovery>,
}

impl RpcServerBuilder {
    pub fn new(connector: ConnectorOption) -> Self {
        Self {
            connector,
            reflection: false,
            descriptor_sets: Vec::new(),
            span: None,
            interceptors: Vec::new(),
            recovery: None,
        }
    }

    /// 启用 gRPC 反射（v1），默认包含健康检查服务的描述
    pub fn reflection(mut self) -> Self {
        self.reflection = true;
        self
    }

    /// 注册业务服务的编码 FileDescriptorSet，供反射使用
    pub fn file_descriptor_set(mut self, encoded: &'static [u8]) -> Self {
        self.descriptor_sets.push(encoded);
        self
    }

    /// 监听器日志所在的父 span
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// 追加一个拦截器，执行顺序与追加顺序一致
    pub fn interceptor(mut self, interceptor: impl RpcInterceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn interceptors(mut self, interceptors: Vec<Arc<dyn RpcInterceptor>>) -> Self {
        self.interceptors.extend(interceptors);
        self
    }

    /// 在拦截器链外层捕获 panic，拦截器与处理器的 panic 都转换为状态返回
    pub fn recovery(mut self, recovery: Recovery) -> Self {
        self.recovery = Some(recovery);
        self
    }

    pub fn build(self) -> RpcServer {
        let (reporter, health_service) = tonic_health::server::health_reporter();
        let mut routes = RoutesBuilder::default();
        routes.add_service(health_service);

        let span = self
            .span
            .unwrap_or_else(|| info_span!("grpc_server", app_name = %self.connector.app_name));

        RpcServer {
            port: self.connector.port,
            app_name: self.connector.app_name,
            reflection: self.reflection,
            descriptor_sets: self.descriptor_sets,
            span,
            chain: InterceptorChain::new(self.interceptors),
            recovery: self.recovery.map(RpcRecoveryLayer::new).unwrap_or_default(),
            routes: Mutex::new(Some(routes)),
            health: HealthFlag::new(),
            reporter,
            health_update: AsyncMutex::new(()),
            lifecycle: ListenerLifecycle::new(),
        }
    }
}

/// gRPC 监听器
pub struct RpcServer {
    port: u16,
    app_name: String,
    reflection: bool,
    descriptor_sets: Vec<&'static [u8]>,
    span: Span,
    chain: InterceptorChain,
    recovery: RpcRecoveryLayer,
    routes: Mutex<Option<RoutesBuilder>>,
    health: HealthFlag,
    reporter: HealthReporter,
    health_update: AsyncMutex<()>,
    lifecycle: ListenerLifecycle,
}

impl RpcServer {
    pub fn builder(connector: ConnectorOption) -> RpcServerBuilder {
        RpcServerBuilder::new(connector)
    }

    /// 在启动前挂载业务服务
    pub fn register(mut self, register_fn: impl FnOnce(&mut RoutesBuilder)) -> Self {
        let routes = self.routes.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(routes) = routes.as_mut() {
            register_fn(routes);
        }
        self
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// 绑定成功后的实际地址（端口为 0 时由系统分配）
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lifecycle.local_addr()
    }

    pub fn health(&self) -> &HealthFlag {
        &self.health
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.state()
    }

    /// 同时更新原子标记和健康检查服务中的整体状态与应用状态
    ///
    /// 停机开始后标记保持 NOT_SERVING，健康检查服务同样如此。
    pub async fn switch_health_status(&self, serving: bool) -> bool {
        let _guard = self.health_update.lock().await;
        let previous = self.health.set_serving(serving);
        self.publish_health().await;
        previous
    }

    async fn drain_health(&self) -> bool {
        let _guard = self.health_update.lock().await;
        let previous = self.health.drain();
        self.publish_health().await;
        previous
    }

    // 调用方需持有 health_update
    async fn publish_health(&self) {
        let status = if self.health.is_serving() {
            ServingStatus::Serving
        } else {
            ServingStatus::NotServing
        };
        self.reporter.set_service_status("", status).await;
        self.reporter.set_service_status(&self.app_name, status).await;
    }

    /// 优雅停止：拒绝新调用，等待进行中的调用完成
    pub async fn graceful_stop(&self) {
        self.lifecycle.stop_and_wait().await;
    }

    async fn serve(&self) -> Result<()> {
        let mut routes = self
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| UranusError::serve(Protocol::Grpc, "listener already started"))?;

        if self.reflection {
            let mut builder = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
            for encoded in &self.descriptor_sets {
                builder = builder.register_encoded_file_descriptor_set(*encoded);
            }
            let reflection = builder
                .build_v1()
                .map_err(|e| UranusError::Reflection(e.to_string()))?;
            routes.add_service(reflection);
        }

        self.switch_health_status(false).await;

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| UranusError::Bind {
                protocol: Protocol::Grpc,
                port: self.port,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        if self.lifecycle.is_shutdown_requested() {
            info!(app_name = %self.app_name, "grpc listener stopped before serving");
            self.lifecycle.mark_stopped();
            return Ok(());
        }
        self.lifecycle.mark_serving(local_addr);
        self.switch_health_status(true).await;
        info!(app_name = %self.app_name, port = local_addr.port(), "grpc listen on port");

        let mut server = Server::builder()
            .layer(self.recovery.clone())
            .layer(MapResponseLayer::new(
                |res: http::Response<ResponseBody<tonic::body::Body>>| {
                    res.map(tonic::body::Body::new)
                },
            ))
            .layer(InterceptorLayer::new(self.chain.clone()));
        let result = server
            .add_routes(routes.routes())
            .serve_with_incoming_shutdown(
                TcpListenerStream::new(listener),
                self.lifecycle.shutdown_signal(),
            )
            .await;

        self.lifecycle.mark_stopped();
        result.map_err(|e| UranusError::serve(Protocol::Grpc, e))
    }
}

#[async_trait]
impl ManagedListener for RpcServer {
    fn protocol(&self) -> Protocol {
        Protocol::Grpc
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
            self.switch_health_status(true).await
        } else {
            self.drain_health().await
        }
    }

    async fn stop(&self, _deadline: Duration) -> Result<()> {
        self.graceful_stop().await;
        Ok(())
    }
}
