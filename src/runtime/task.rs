//! 托管任务
//!
//! 与监听器一起运行的后台任务（例如消费者组）。宿主在停机第三步取消任务，
//! 任务应在收到取消信号后尽快返回。

use std::future::Future;
use std::pin::Pin;

use tokio_util::sync::CancellationToken;

/// 任务执行结果
pub type TaskResult = crate::error::Result<()>;

/// 任务 trait
pub trait Task: Send {
    fn name(&self) -> &str;

    /// 运行任务，`shutdown` 被取消时应优雅退出
    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send>>;
}

type TaskFn =
    Box<dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = TaskResult> + Send>> + Send>;

/// 由闭包构建的任务
///
/// ```rust,no_run
/// use uranus_core::runtime::SpawnTask;
///
/// let task = SpawnTask::with_shutdown("ticker", |shutdown| async move {
///     shutdown.cancelled().await;
///     Ok(())
/// });
/// ```
pub struct SpawnTask {
    name: String,
    future_fn: TaskFn,
}

impl SpawnTask {
    /// 不关心取消信号的任务，停机时直接被丢弃
    pub fn new<Fut>(name: impl Into<String>, future: Fut) -> Self
    where
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self::with_shutdown(name, move |shutdown| async move {
            tokio::select! {
                result = future => result,
                _ = shutdown.cancelled() => Ok(()),
            }
        })
    }

    pub fn with_shutdown<F, Fut>(name: impl Into<String>, future_fn: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = TaskResult> + Send + 'static,
    {
        Self {
            name: name.into(),
            future_fn: Box::new(move |shutdown| Box::pin(future_fn(shutdown))),
        }
    }
}

impl Task for SpawnTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(
        self: Box<Self>,
        shutdown: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = TaskResult> + Send>> {
        (self.future_fn)(shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_task_stops_on_cancel() {
        let task = Box::new(SpawnTask::new("forever", async {
            std::future::pending::<()>().await;
            Ok(())
        }));
        assert_eq!(task.name(), "forever");

        let token = CancellationToken::new();
        token.cancel();
        task.run(token).await.unwrap();
    }
}
