//! Uranus 错误处理模块
//!
//! 所有致命错误都以 `UranusError` 的形式返回给唯一的顶层入口
//! （见 [`crate::runtime::terminate`]），库代码本身从不退出进程。

pub mod fatal;

pub use fatal::FatalPhase;

use std::fmt;
use thiserror::Error;

/// 监听器协议
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Grpc,
    Http,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Grpc => "grpc",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uranus 统一错误类型
#[derive(Error, Debug)]
pub enum UranusError {
    /// 配置错误
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// 无法识别的分区分配策略
    #[error("unrecognized consumer group partition assignor: {0}")]
    UnrecognizedAssignor(String),

    /// 无法捕获或不支持的信号
    #[error("unsupported termination signal: {0}")]
    UnsupportedSignal(String),

    /// 端口绑定失败
    #[error("{protocol} listener failed to bind port {port}: {source}")]
    Bind {
        protocol: Protocol,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// 监听器在服务过程中异常退出
    #[error("{protocol} listener terminated: {reason}")]
    Serve { protocol: Protocol, reason: String },

    /// HTTP 优雅关闭失败
    #[error("http shutdown failed: {0}")]
    HttpShutdown(String),

    /// gRPC 反射服务构建失败
    #[error("grpc reflection setup failed: {0}")]
    Reflection(String),

    /// Broker 连接失败
    #[error("broker connection failed: {0}")]
    BrokerConnection(String),

    /// 消费会话失败
    #[error("consumer session failed: {0}")]
    Session(String),

    /// 后台任务失败
    #[error("task '{name}' failed: {reason}")]
    Task { name: String, reason: String },

    /// 关闭消费组客户端失败
    #[error("failed to close consumer group client: {0}")]
    ClientClose(String),

    /// 信号处理器安装失败
    #[error("failed to install signal handler: {0}")]
    Signal(#[source] std::io::Error),

    /// 日志订阅器安装失败
    #[error("failed to install tracing subscriber: {0}")]
    Telemetry(String),

    /// IO 错误
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件解析错误
    #[error("failed to parse configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl UranusError {
    /// 创建配置错误
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        UranusError::InvalidConfig(reason.into())
    }

    /// 创建服务错误
    pub fn serve(protocol: Protocol, reason: impl fmt::Display) -> Self {
        UranusError::Serve {
            protocol,
            reason: reason.to_string(),
        }
    }

    /// 错误发生的生命周期阶段
    pub fn phase(&self) -> FatalPhase {
        match self {
            UranusError::InvalidConfig(_)
            | UranusError::UnrecognizedAssignor(_)
            | UranusError::UnsupportedSignal(_)
            | UranusError::Bind { .. }
            | UranusError::Reflection(_)
            | UranusError::BrokerConnection(_)
            | UranusError::Signal(_)
            | UranusError::Telemetry(_)
            | UranusError::Toml(_) => FatalPhase::Startup,
            UranusError::Serve { .. }
            | UranusError::Session(_)
            | UranusError::Task { .. }
            | UranusError::Io(_) => FatalPhase::Runtime,
            UranusError::HttpShutdown(_) | UranusError::ClientClose(_) => FatalPhase::Shutdown,
        }
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, UranusError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_failure_is_a_startup_condition() {
        let err = UranusError::Bind {
            protocol: Protocol::Http,
            port: 1323,
            source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
        };
        assert_eq!(err.phase(), FatalPhase::Startup);
        assert!(err.to_string().starts_with("http listener failed to bind port 1323"));
    }

    #[test]
    fn close_failure_is_a_shutdown_condition() {
        let err = UranusError::ClientClose("broker gone".into());
        assert_eq!(err.phase(), FatalPhase::Shutdown);
        assert_eq!(err.phase().exit_code(), 1);
    }
}
