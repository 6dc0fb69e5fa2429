//! 配置文件
//!
//! TOML 先反序列化为原始结构，再一次性校验为强类型配置；任何无法识别的取值
//! 都会在获取任何资源之前返回错误。

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, UranusError};
use crate::kafka::ConsumerGroupConfig;
use crate::runtime::{ShutdownPolicy, TerminationSignal};
use crate::telemetry::{LogConfig, LogFormat};

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawConfig {
    service: RawServiceConfig,
    #[serde(default)]
    log: RawLogConfig,
    grpc: Option<RawGrpcConfig>,
    http: Option<RawHttpConfig>,
    #[serde(default)]
    shutdown: RawShutdownConfig,
    consumer: Option<RawConsumerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawServiceConfig {
    name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawLogConfig {
    #[serde(default = "default_log_level")]
    level: String,
    #[serde(default = "default_log_format")]
    format: String,
}

impl Default for RawLogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawGrpcConfig {
    port: u16,
    app_name: Option<String>,
    #[serde(default)]
    reflection: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawHttpConfig {
    port: u16,
    app_name: Option<String>,
    #[serde(default = "default_health_path")]
    health_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawShutdownConfig {
    #[serde(default = "default_drain_wait_secs")]
    drain_wait_secs: u64,
    #[serde(default = "default_hard_stop_wait_secs")]
    hard_stop_wait_secs: u64,
    #[serde(default = "default_delay_secs")]
    delay_secs: u64,
    #[serde(default = "default_shutdown_deadline_secs")]
    shutdown_deadline_secs: u64,
    #[serde(default = "default_signals")]
    signals: Vec<String>,
}

impl Default for RawShutdownConfig {
    fn default() -> Self {
        Self {
            drain_wait_secs: default_drain_wait_secs(),
            hard_stop_wait_secs: default_hard_stop_wait_secs(),
            delay_secs: default_delay_secs(),
            shutdown_deadline_secs: default_shutdown_deadline_secs(),
            signals: default_signals(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
struct RawConsumerConfig {
    brokers: Vec<String>,
    topics: Vec<String>,
    group_id: String,
    #[serde(default = "default_assignor")]
    assignor: String,
    #[serde(default = "default_initial_offset")]
    initial_offset: String,
    #[serde(default = "default_session_timeout_ms")]
    session_timeout_ms: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_drain_wait_secs() -> u64 {
    5
}

fn default_hard_stop_wait_secs() -> u64 {
    10
}

fn default_delay_secs() -> u64 {
    10
}

fn default_shutdown_deadline_secs() -> u64 {
    30
}

fn default_signals() -> Vec<String> {
    vec!["SIGINT".to_string(), "SIGQUIT".to_string(), "SIGTERM".to_string()]
}

fn default_assignor() -> String {
    "range".to_string()
}

fn default_initial_offset() -> String {
    "newest".to_string()
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcConfig {
    pub port: u16,
    pub app_name: String,
    pub reflection: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub port: u16,
    pub app_name: String,
    pub health_path: String,
}

/// 校验后的完整配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub service: ServiceConfig,
    pub log: LogConfig,
    pub grpc: Option<GrpcConfig>,
    pub http: Option<HttpConfig>,
    pub shutdown: ShutdownPolicy,
    pub consumer: Option<ConsumerGroupConfig>,
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self> {
        let name = raw.service.name.trim().to_owned();
        if name.is_empty() {
            return Err(UranusError::invalid_config("service name is empty"));
        }

        let log = LogConfig {
            level: raw.log.level,
            format: raw.log.format.parse::<LogFormat>()?,
        };

        let grpc = raw.grpc.map(|grpc| GrpcConfig {
            port: grpc.port,
            app_name: grpc.app_name.unwrap_or_else(|| name.clone()),
            reflection: grpc.reflection,
        });

        let http = raw.http.map(|http| HttpConfig {
            port: http.port,
            app_name: http.app_name.unwrap_or_else(|| name.clone()),
            health_path: http.health_path,
        });

        if let (Some(grpc), Some(http)) = (&grpc, &http) {
            if grpc.port != 0 && grpc.port == http.port {
                return Err(UranusError::invalid_config(format!(
                    "grpc and http listeners share port {}",
                    grpc.port
                )));
            }
        }

        let signals = raw
            .shutdown
            .signals
            .iter()
            .map(|s| s.parse::<TerminationSignal>())
            .collect::<Result<Vec<_>>>()?;
        if signals.is_empty() {
            return Err(UranusError::invalid_config(
                "at least one termination signal is required",
            ));
        }

        let shutdown = ShutdownPolicy::default()
            .with_drain_wait(Duration::from_secs(raw.shutdown.drain_wait_secs))
            .with_hard_stop_wait(Duration::from_secs(raw.shutdown.hard_stop_wait_secs))
            .with_delay(Duration::from_secs(raw.shutdown.delay_secs))
            .with_shutdown_deadline(Duration::from_secs(raw.shutdown.shutdown_deadline_secs))
            .with_signals(signals);

        let consumer = raw
            .consumer
            .map(|consumer| {
                ConsumerGroupConfig::new(
                    consumer.brokers,
                    consumer.topics,
                    consumer.group_id,
                    &consumer.assignor,
                    &consumer.initial_offset,
                )
                .map(|config| {
                    config.with_session_timeout(Duration::from_millis(consumer.session_timeout_ms))
                })
            })
            .transpose()?;

        Ok(Self {
            service: ServiceConfig { name },
            log,
            grpc,
            http,
            shutdown,
            consumer,
        })
    }
}
