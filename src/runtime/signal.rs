//! 进程信号
//!
//! 终止信号触发停机；SIGUSR1 作为运维信号，用于切换消费者的暂停状态。
//! SIGKILL、SIGSTOP 无法被进程捕获，配置中出现时直接拒绝。

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

use tracing::info;

use crate::error::{Result, UranusError};

/// 可捕获的终止信号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TerminationSignal {
    Interrupt,
    Terminate,
    Quit,
    Hangup,
}

impl TerminationSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationSignal::Interrupt => "SIGINT",
            TerminationSignal::Terminate => "SIGTERM",
            TerminationSignal::Quit => "SIGQUIT",
            TerminationSignal::Hangup => "SIGHUP",
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            TerminationSignal::Interrupt => SignalKind::interrupt(),
            TerminationSignal::Terminate => SignalKind::terminate(),
            TerminationSignal::Quit => SignalKind::quit(),
            TerminationSignal::Hangup => SignalKind::hangup(),
        }
    }
}

impl fmt::Display for TerminationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TerminationSignal {
    type Err = UranusError;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim().to_ascii_uppercase();
        let name = name.strip_prefix("SIG").unwrap_or(&name);
        match name {
            "INT" => Ok(TerminationSignal::Interrupt),
            "TERM" => Ok(TerminationSignal::Terminate),
            "QUIT" => Ok(TerminationSignal::Quit),
            "HUP" => Ok(TerminationSignal::Hangup),
            _ => Err(UranusError::UnsupportedSignal(s.trim().to_owned())),
        }
    }
}

/// 默认终止信号：SIGINT、SIGQUIT、SIGTERM
pub fn default_signals() -> Vec<TerminationSignal> {
    vec![
        TerminationSignal::Interrupt,
        TerminationSignal::Quit,
        TerminationSignal::Terminate,
    ]
}

/// 已注册的终止信号监听
///
/// 在启动监听器之前注册，避免启动过程中到达的信号被默认处理直接杀死进程。
pub struct TerminationListener {
    #[cfg(unix)]
    streams: Vec<(TerminationSignal, tokio::signal::unix::Signal)>,
}

impl TerminationListener {
    pub fn install(signals: &[TerminationSignal]) -> Result<Self> {
        if signals.is_empty() {
            return Err(UranusError::invalid_config(
                "at least one termination signal is required",
            ));
        }

        #[cfg(unix)]
        {
            let mut streams = Vec::with_capacity(signals.len());
            for signal in signals {
                let stream =
                    tokio::signal::unix::signal(signal.kind()).map_err(UranusError::Signal)?;
                streams.push((*signal, stream));
            }
            Ok(Self { streams })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// 等待任意一个终止信号，返回收到的信号
    #[cfg(unix)]
    pub async fn recv(&mut self) -> TerminationSignal {
        let waits: Vec<Pin<Box<dyn Future<Output = TerminationSignal> + Send + '_>>> = self
            .streams
            .iter_mut()
            .map(|(signal, stream)| {
                let signal = *signal;
                Box::pin(async move {
                    stream.recv().await;
                    signal
                }) as Pin<Box<dyn Future<Output = TerminationSignal> + Send + '_>>
            })
            .collect();
        let (signal, _, _) = futures::future::select_all(waits).await;
        info!(signal = %signal, "termination signal received");
        signal
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> TerminationSignal {
        let _ = tokio::signal::ctrl_c().await;
        info!(signal = %TerminationSignal::Interrupt, "termination signal received");
        TerminationSignal::Interrupt
    }
}

/// 注册并等待一次终止信号
pub async fn wait_for_termination(signals: &[TerminationSignal]) -> Result<TerminationSignal> {
    let mut listener = TerminationListener::install(signals)?;
    Ok(listener.recv().await)
}

/// 运维信号（SIGUSR1）
pub struct OperationalSignal {
    #[cfg(unix)]
    stream: tokio::signal::unix::Signal,
}

impl OperationalSignal {
    pub fn user_defined() -> Result<Self> {
        #[cfg(unix)]
        {
            let stream =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::user_defined1())
                    .map_err(UranusError::Signal)?;
            Ok(Self { stream })
        }

        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    /// 等待下一次信号；非 unix 平台永不返回
    pub async fn recv(&mut self) {
        #[cfg(unix)]
        {
            if self.stream.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }

        #[cfg(not(unix))]
        std::future::pending::<()>().await
    }
}
