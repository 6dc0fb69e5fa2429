//! Uranus Server Core Library
//!
//! Hosts a gRPC listener and an HTTP listener in one process with a coordinated
//! health signal and a multi-phase graceful shutdown, plus a Kafka consumer-group
//! lifecycle manager with rebalance handling and operator pause/resume.

pub mod config;
pub mod error;
pub mod health;
pub mod interceptor;
pub mod kafka;
pub mod runtime;
pub mod server;
pub mod telemetry;

// Re-exports
pub use config::{Config, GrpcConfig, HttpConfig, ServiceConfig};
pub use error::{FatalPhase, Protocol, Result, UranusError};
pub use health::{HealthFlag, HealthStatus};
pub use interceptor::{
    CORRELATION_ID_KEY, CorrelationId, HttpCorrelation, HttpMiddleware, HttpRecovery,
    HttpRequestLogging, InterceptorChain, Recovery, RpcCorrelation, RpcInterceptor, RpcLogging,
};
pub use kafka::{
    Assignor, ConsumerGroupConfig, ConsumerGroupManager, ConsumerRecord, ConsumerState,
    GroupClient, InitialOffset, MessageHandler, ReadinessGate,
};
pub use runtime::{ServiceHost, ShutdownPolicy, SpawnTask, Task, TerminationSignal, terminate};
pub use server::{
    ConnectorOption, HttpServer, HttpServerBuilder, ListenerState, ManagedListener, RpcServer,
    RpcServerBuilder,
};
pub use telemetry::{LogConfig, LogFormat, init_tracing};
