use async_trait::async_trait;
use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tonic::Status;
use tonic::metadata::{Ascii, MetadataValue};
use uuid::Uuid;

use super::{HttpMiddleware, RpcInterceptor};

/// 关联 ID 的元数据/请求头名称
pub const CORRELATION_ID_KEY: &str = "x-correlation-id";

/// 请求关联 ID，存放在请求扩展中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// 生成新的关联 ID（UUIDv7，按时间有序）
pub fn new_correlation_id() -> String {
    Uuid::now_v7().to_string()
}

fn incoming_or_new(value: Option<&str>) -> String {
    value
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(new_correlation_id)
}

/// gRPC 关联 ID 拦截器
///
/// 沿用调用方传入的 `x-correlation-id`，否则生成新的。
#[derive(Debug, Clone, Copy, Default)]
pub struct RpcCorrelation;

impl RpcInterceptor for RpcCorrelation {
    fn intercept(&self, mut req: tonic::Request<()>) -> Result<tonic::Request<()>, Status> {
        let id = incoming_or_new(
            req.metadata()
                .get(CORRELATION_ID_KEY)
                .and_then(|v| v.to_str().ok()),
        );

        let value: MetadataValue<Ascii> = id
            .parse()
            .map_err(|_| Status::invalid_argument("invalid correlation id"))?;
        req.metadata_mut().insert(CORRELATION_ID_KEY, value);
        req.extensions_mut().insert(CorrelationId(id));
        Ok(req)
    }
}

/// HTTP 关联 ID 中间件，同时回写到响应头
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpCorrelation;

#[async_trait]
impl HttpMiddleware for HttpCorrelation {
    async fn handle(&self, mut req: Request, next: Next) -> Response {
        let id = incoming_or_new(
            req.headers()
                .get(CORRELATION_ID_KEY)
                .and_then(|v| v.to_str().ok()),
        );
        req.extensions_mut().insert(CorrelationId(id.clone()));

        let mut response = next.run(req).await;
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(CORRELATION_ID_KEY, value);
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_incoming_correlation_id() {
        let mut req = tonic::Request::new(());
        req.metadata_mut()
            .insert(CORRELATION_ID_KEY, "abc-123".parse().unwrap());

        let req = RpcCorrelation.intercept(req).unwrap();
        assert_eq!(
            req.extensions().get::<CorrelationId>(),
            Some(&CorrelationId("abc-123".into()))
        );
    }

    #[test]
    fn generates_correlation_id_when_missing() {
        let req = RpcCorrelation.intercept(tonic::Request::new(())).unwrap();
        let id = req.extensions().get::<CorrelationId>().unwrap();
        assert!(Uuid::parse_str(id.as_str()).is_ok());
        assert_eq!(
            req.metadata().get(CORRELATION_ID_KEY).unwrap().to_str().unwrap(),
            id.as_str()
        );
    }
}
