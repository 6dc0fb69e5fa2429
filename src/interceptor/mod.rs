//! 拦截器与中间件模块
//!
//! gRPC 侧通过 [`InterceptorChain`] 组合 [`RpcInterceptor`]，HTTP 侧通过
//! [`HttpMiddleware`] 组合 axum 中间件。两者都严格按照配置顺序执行：
//! 先配置的先看到请求。

pub mod correlation;
pub mod logging;
pub mod recovery;

pub use correlation::{
    CORRELATION_ID_KEY, CorrelationId, HttpCorrelation, RpcCorrelation, new_correlation_id,
};
pub use logging::{HttpRequestLogging, RpcLogging};
pub use recovery::{HttpRecovery, Recovery, RecoveryHandler, RpcRecoveryLayer};

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tonic::Status;

/// gRPC 拦截器
///
/// 只能看到请求元数据与扩展，返回 `Err` 时请求直接以该状态结束。
pub trait RpcInterceptor: Send + Sync + 'static {
    fn intercept(&self, req: tonic::Request<()>) -> Result<tonic::Request<()>, Status>;
}

impl<F> RpcInterceptor for F
where
    F: Fn(tonic::Request<()>) -> Result<tonic::Request<()>, Status> + Send + Sync + 'static,
{
    fn intercept(&self, req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        self(req)
    }
}

/// 有序拦截器链
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<Vec<Arc<dyn RpcInterceptor>>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn RpcInterceptor>>) -> Self {
        Self {
            interceptors: Arc::new(interceptors),
        }
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// 按顺序应用拦截器，任意一个失败即短路
    pub fn apply(&self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        for interceptor in self.interceptors.iter() {
            req = interceptor.intercept(req)?;
        }
        Ok(req)
    }
}

impl tonic::service::Interceptor for InterceptorChain {
    fn call(&mut self, req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        self.apply(req)
    }
}

/// HTTP 中间件
#[async_trait]
pub trait HttpMiddleware: Send + Sync + 'static {
    async fn handle(&self, req: Request, next: Next) -> Response;
}

/// 将中间件按配置顺序包裹到路由上
///
/// axum 中后调用 `layer` 的在最外层，所以这里倒序应用。
/// 必须在所有路由注册完成之后调用，之后添加的路由不会经过中间件。
pub(crate) fn apply_middlewares(mut router: Router, middlewares: &[Arc<dyn HttpMiddleware>]) -> Router {
    for middleware in middlewares.iter().rev() {
        let middleware = Arc::clone(middleware);
        router = router.layer(axum::middleware::from_fn(move |req: Request, next: Next| {
            let middleware = Arc::clone(&middleware);
            async move { middleware.handle(req, next).await }
        }));
    }
    router
}
