//! panic 恢复
//!
//! gRPC 侧是包在拦截器链外层的 tower 层，拦截器或处理器 panic 时返回
//! `Status::internal`；HTTP 侧是普通的 [`HttpMiddleware`]，返回 500。
//! 两者共用 [`Recovery`]，可以用 [`Recovery::with_recovery_handler`] 自定义返回的状态。

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::Json;
use axum::extract::Request;
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::json;
use tonic::Status;
use tonic::codegen::http;
use tower::{Layer, Service};
use tracing::error;

use super::HttpMiddleware;

/// 自定义恢复函数，参数为 panic 信息
pub type RecoveryHandler = Arc<dyn Fn(&str) -> Status + Send + Sync>;

/// 取出 panic 载荷中的文本
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// 恢复策略
#[derive(Clone, Default)]
pub struct Recovery {
    handler: Option<RecoveryHandler>,
}

impl Recovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// 自定义 panic 转换成的状态，默认是 `Status::internal(panic 信息)`
    pub fn with_recovery_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str) -> Status + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn recover(&self, payload: Box<dyn Any + Send>) -> Status {
        let message = panic_message(payload.as_ref());
        error!(panic = %message, "recovered from panic");
        match &self.handler {
            Some(handler) => handler(&message),
            None => Status::internal(message),
        }
    }
}

/// gRPC 恢复层，未配置 [`Recovery`] 时直接透传
#[derive(Clone, Default)]
pub struct RpcRecoveryLayer {
    recovery: Option<Recovery>,
}

impl RpcRecoveryLayer {
    pub fn new(recovery: Recovery) -> Self {
        Self {
            recovery: Some(recovery),
        }
    }
}

impl<S> Layer<S> for RpcRecoveryLayer {
    type Service = RpcRecoveryService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcRecoveryService {
            inner,
            recovery: self.recovery.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RpcRecoveryService<S> {
    inner: S,
    recovery: Option<Recovery>,
}

impl<S, B, ResBody> Service<http::Request<B>> for RpcRecoveryService<S>
where
    S: Service<http::Request<B>, Response = http::Response<ResBody>>,
    S::Future: Send + 'static,
    ResBody: Default + Send + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(recovery) = self.recovery.clone() else {
            return Box::pin(self.inner.call(req));
        };

        // 拦截器在 call 中同步执行，处理器在返回的 future 中执行
        match catch_unwind(AssertUnwindSafe(|| self.inner.call(req))) {
            Ok(future) => Box::pin(async move {
                match AssertUnwindSafe(future).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => Ok(recovery.recover(payload).into_http()),
                }
            }),
            Err(payload) => {
                let response = recovery.recover(payload).into_http();
                Box::pin(async move { Ok(response) })
            }
        }
    }
}

/// HTTP 恢复中间件，应作为第一个中间件配置
#[derive(Clone, Default)]
pub struct HttpRecovery {
    recovery: Recovery,
}

impl HttpRecovery {
    pub fn new(recovery: Recovery) -> Self {
        Self { recovery }
    }
}

#[async_trait]
impl HttpMiddleware for HttpRecovery {
    async fn handle(&self, req: Request, next: Next) -> Response {
        match AssertUnwindSafe(next.run(req)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                let status = self.recovery.recover(payload);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": status.message() })),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;
    use std::future::Ready;
    use tonic::Code;
    use tower::{ServiceExt, service_fn};

    fn panics_in_call(_req: http::Request<()>) -> Ready<Result<http::Response<String>, Infallible>> {
        panic!("interceptor exploded")
    }

    async fn panics_in_future(_req: http::Request<()>) -> Result<http::Response<String>, Infallible> {
        panic!("handler exploded")
    }

    async fn answers(_req: http::Request<()>) -> Result<http::Response<String>, Infallible> {
        Ok(http::Response::new("ok".to_string()))
    }

    async fn status_of<S>(service: S) -> Status
    where
        S: Service<http::Request<()>, Response = http::Response<String>, Error = Infallible>,
    {
        let response = service.oneshot(http::Request::new(())).await.unwrap();
        Status::from_header_map(response.headers()).expect("grpc status headers")
    }

    #[test]
    fn extracts_panic_text() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&42u32), "unknown panic");
    }

    #[tokio::test]
    async fn synchronous_panic_becomes_internal() {
        let service = RpcRecoveryLayer::new(Recovery::new()).layer(service_fn(panics_in_call));
        let status = status_of(service).await;
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "interceptor exploded");
    }

    #[tokio::test]
    async fn panic_inside_handler_future_becomes_internal() {
        let service = RpcRecoveryLayer::new(Recovery::new()).layer(service_fn(panics_in_future));
        let status = status_of(service).await;
        assert_eq!(status.code(), Code::Internal);
        assert_eq!(status.message(), "handler exploded");
    }

    #[tokio::test]
    async fn custom_handler_decides_status() {
        let recovery = Recovery::new()
            .with_recovery_handler(|message| Status::unavailable(format!("recovered: {message}")));
        let service = RpcRecoveryLayer::new(recovery).layer(service_fn(panics_in_future));
        let status = status_of(service).await;
        assert_eq!(status.code(), Code::Unavailable);
        assert_eq!(status.message(), "recovered: handler exploded");
    }

    #[tokio::test]
    async fn default_layer_passes_through() {
        let service = RpcRecoveryLayer::default().layer(service_fn(answers));
        let response = service.oneshot(http::Request::new(())).await.unwrap();
        assert_eq!(response.into_body(), "ok");
    }
}
