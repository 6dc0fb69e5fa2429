//! 服务运行时
//!
//! - [`ServiceHost`]：双协议服务宿主与多阶段优雅停机
//! - [`ShutdownPolicy`]：停机时间参数与触发信号
//! - [`Task`]：由宿主托管的后台任务
//! - [`terminate`]：进程唯一的退出点
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use uranus_core::runtime::{ServiceHost, ShutdownPolicy, terminate};
//! use uranus_core::server::{ConnectorOption, HttpServer, RpcServer};
//!
//! # async fn example() {
//! let grpc = RpcServer::builder(ConnectorOption::new(50051, "orders")).build();
//! let http = HttpServer::builder(1323, "orders").build().health_check("/health");
//!
//! let result = ServiceHost::builder()
//!     .with_grpc_server(grpc)
//!     .with_http_server(http)
//!     .with_graceful_shutdown(ShutdownPolicy::default())
//!     .build()
//!     .run()
//!     .await;
//! terminate(result);
//! # }
//! ```

pub mod config;
pub mod host;
pub mod signal;
pub mod task;

pub use config::ShutdownPolicy;
pub use host::{ServiceHost, ServiceHostBuilder};
pub use signal::{
    OperationalSignal, TerminationListener, TerminationSignal, default_signals,
    wait_for_termination,
};
pub use task::{SpawnTask, Task, TaskResult};

use tracing::{error, info};

use crate::error::Result;

/// 根据运行结果结束进程：成功退出码 0，致命错误记录日志后以非零退出码结束
pub fn terminate(result: Result<()>) -> ! {
    match result {
        Ok(()) => {
            info!("process exiting");
            std::process::exit(0)
        }
        Err(e) => {
            let phase = e.phase();
            error!(phase = %phase, error = %e, "fatal error, process exiting");
            std::process::exit(phase.exit_code())
        }
    }
}
