use std::time::Instant;

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use tonic::Status;
use tracing::{error, info, warn};

use super::{CorrelationId, HttpMiddleware, RpcInterceptor};

/// gRPC 日志拦截器
///
/// 拦截器拿不到响应，这里只记录请求到达。
#[derive(Debug, Clone)]
pub struct RpcLogging {
    app_name: String,
}

impl RpcLogging {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

impl RpcInterceptor for RpcLogging {
    fn intercept(&self, req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        let correlation_id = req
            .extensions()
            .get::<CorrelationId>()
            .map(CorrelationId::as_str)
            .unwrap_or_default();

        info!(
            app_name = %self.app_name,
            correlation_id = %correlation_id,
            remote_addr = ?req.remote_addr(),
            "gRPC request received"
        );
        Ok(req)
    }
}

/// HTTP 请求日志中间件
///
/// 日志级别按状态码区分：5xx 为 error，4xx 为 warn，其余为 info。
/// 需要放在 [`super::HttpCorrelation`] 之后才能记录关联 ID。
#[derive(Debug, Clone)]
pub struct HttpRequestLogging {
    app_name: String,
}

impl HttpRequestLogging {
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            app_name: app_name.into(),
        }
    }
}

#[async_trait]
impl HttpMiddleware for HttpRequestLogging {
    async fn handle(&self, req: Request, next: Next) -> Response {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_owned();
        let query = req.uri().query().unwrap_or_default().to_owned();
        let correlation_id = req
            .extensions()
            .get::<CorrelationId>()
            .map(|id| id.0.clone())
            .unwrap_or_default();

        let response = next.run(req).await;

        let status = response.status().as_u16();
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;
        match status {
            500.. => error!(
                %method, %path, %query, status, duration_ms,
                app_name = %self.app_name, %correlation_id,
                "HTTP request completed"
            ),
            400..=499 => warn!(
                %method, %path, %query, status, duration_ms,
                app_name = %self.app_name, %correlation_id,
                "HTTP request completed"
            ),
            _ => info!(
                %method, %path, %query, status, duration_ms,
                app_name = %self.app_name, %correlation_id,
                "HTTP request completed"
            ),
        }
        response
    }
}
