use std::fmt;

/// 致命错误发生的生命周期阶段
///
/// 启动期错误（端口绑定、配置、Broker 连接）和关闭期错误（客户端关闭失败）
/// 都不会重试，由顶层入口结束进程。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalPhase {
    Startup,
    Runtime,
    Shutdown,
}

impl FatalPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FatalPhase::Startup => "startup",
            FatalPhase::Runtime => "runtime",
            FatalPhase::Shutdown => "shutdown",
        }
    }

    /// 进程退出码，所有致命阶段统一为 1
    pub fn exit_code(&self) -> i32 {
        1
    }
}

impl fmt::Display for FatalPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
