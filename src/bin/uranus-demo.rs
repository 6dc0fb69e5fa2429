//! 示例服务
//!
//! ```text
//! uranus-demo config/uranus.toml
//! ```
//!
//! 按配置文件启动 gRPC 与 HTTP 监听器；启用 `kafka` feature 且配置了
//! `[consumer]` 时同时运行消费者组。

use axum::routing::get;
use axum::Json;
use serde_json::json;
use tracing::info;

use uranus_core::config::Config;
use uranus_core::interceptor::{HttpCorrelation, HttpRequestLogging, RpcCorrelation, RpcLogging};
use uranus_core::runtime::{ServiceHost, terminate};
use uranus_core::server::{ConnectorOption, HttpServer, RpcServer};
use uranus_core::telemetry::{LogConfig, init_tracing};

/// 加载配置并安装日志订阅者
fn bootstrap(path: &str) -> uranus_core::Result<Config> {
    let config = Config::load_from_file(path)?;
    init_tracing(&config.log)?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/uranus.toml".to_string());
    let config = match bootstrap(&path) {
        Ok(config) => config,
        Err(e) => {
            // 日志尚未安装时退回默认配置，保证致命错误能被记录
            let _ = init_tracing(&LogConfig::default());
            tracing::error!(path = %path, "failed to bootstrap service");
            terminate(Err(e))
        }
    };

    info!(service = %config.service.name, "starting service");

    let mut builder = ServiceHost::builder().with_graceful_shutdown(config.shutdown.clone());

    if let Some(grpc) = &config.grpc {
        let mut server = RpcServer::builder(ConnectorOption::new(grpc.port, &grpc.app_name))
            .interceptor(RpcCorrelation)
            .interceptor(RpcLogging::new(&grpc.app_name));
        if grpc.reflection {
            server = server.reflection();
        }
        builder = builder.with_grpc_server(server.build());
    }

    if let Some(http) = &config.http {
        let server = HttpServer::builder(http.port, &http.app_name)
            .middleware(HttpCorrelation)
            .middleware(HttpRequestLogging::new(&http.app_name))
            .build()
            .health_check(&http.health_path)
            .register_router(|router| {
                router.route("/ping", get(|| async { Json(json!({ "message": "pong" })) }))
            });
        builder = builder.with_http_server(server);
    }

    #[cfg(feature = "kafka")]
    if let Some(consumer) = &config.consumer {
        use std::sync::Arc;
        use uranus_core::kafka::{ConsumerGroupManager, RdKafkaGroupClient};

        let client = match RdKafkaGroupClient::connect(consumer).await {
            Ok(client) => Arc::new(client),
            Err(e) => terminate(Err(e)),
        };
        let manager = Arc::new(ConsumerGroupManager::builder(consumer.clone(), client).build());
        builder = builder.with_task(Box::new(manager));
    }

    #[cfg(not(feature = "kafka"))]
    if config.consumer.is_some() {
        tracing::warn!("[consumer] is configured but the kafka feature is disabled");
    }

    terminate(builder.build().run().await)
}
