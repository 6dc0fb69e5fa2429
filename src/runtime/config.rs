//! 停机策略配置

use std::time::Duration;

use super::signal::{TerminationSignal, default_signals};

/// 停机策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownPolicy {
    /// 健康检查置为不可用后、关闭监听器前的等待时间（默认 5 秒）
    pub drain_wait: Duration,
    /// HTTP 监听器关闭失败后的额外等待时间（默认 10 秒）
    pub hard_stop_wait: Duration,
    /// 保留字段，当前不参与停机流程（默认 10 秒）
    pub delay: Duration,
    /// 单个监听器关闭或任务退出的最长等待时间（默认 30 秒）
    pub shutdown_deadline: Duration,
    /// 触发停机的信号集合
    pub signals: Vec<TerminationSignal>,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            drain_wait: Duration::from_secs(5),
            hard_stop_wait: Duration::from_secs(10),
            delay: Duration::from_secs(10),
            shutdown_deadline: Duration::from_secs(30),
            signals: default_signals(),
        }
    }
}

impl ShutdownPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drain_wait(mut self, wait: Duration) -> Self {
        self.drain_wait = wait;
        self
    }

    pub fn with_hard_stop_wait(mut self, wait: Duration) -> Self {
        self.hard_stop_wait = wait;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_shutdown_deadline(mut self, deadline: Duration) -> Self {
        self.shutdown_deadline = deadline;
        self
    }

    pub fn with_signals(mut self, signals: Vec<TerminationSignal>) -> Self {
        self.signals = signals;
        self
    }
}
