//! 健康检查模块
//!
//! 两个监听器各持有一个 `HealthFlag`，由服务宿主在启动成功和关闭开始时切换。
//! 任何任务都可以读取，只有宿主（以及监听器自身在绑定成功时）会写入。

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const NOT_SERVING: u8 = 0;
const SERVING: u8 = 1;
const DRAINING: u8 = 2;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Serving,
    NotServing,
}

impl From<bool> for HealthStatus {
    fn from(serving: bool) -> Self {
        if serving {
            HealthStatus::Serving
        } else {
            HealthStatus::NotServing
        }
    }
}

/// 原子健康标记
///
/// 写入使用 `AcqRel`，读取使用 `Acquire`。默认值为 NOT_SERVING。
/// 调用 [`HealthFlag::drain`] 之后标记锁定为 NOT_SERVING，之后的
/// `set_serving(true)` 不再生效。
#[derive(Debug, Clone, Default)]
pub struct HealthFlag {
    state: Arc<AtomicU8>,
}

impl HealthFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置服务状态，返回之前是否处于服务中；停机中的标记保持不变
    pub fn set_serving(&self, serving: bool) -> bool {
        let next = if serving { SERVING } else { NOT_SERVING };
        let previous = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |state| {
                (state != DRAINING).then_some(next)
            })
            .unwrap_or_else(|state| state);
        previous == SERVING
    }

    /// 进入停机：置为 NOT_SERVING 并锁定，返回之前是否处于服务中
    pub fn drain(&self) -> bool {
        self.state.swap(DRAINING, Ordering::AcqRel) == SERVING
    }

    pub fn is_serving(&self) -> bool {
        self.state.load(Ordering::Acquire) == SERVING
    }

    pub fn is_draining(&self) -> bool {
        self.state.load(Ordering::Acquire) == DRAINING
    }

    pub fn status(&self) -> HealthStatus {
        self.is_serving().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_not_serving() {
        let flag = HealthFlag::new();
        assert!(!flag.is_serving());
        assert!(!flag.is_draining());
        assert_eq!(flag.status(), HealthStatus::NotServing);
    }

    #[test]
    fn clones_share_state() {
        let flag = HealthFlag::new();
        let reader = flag.clone();
        assert!(!flag.set_serving(true));
        assert!(reader.is_serving());
        assert!(flag.set_serving(false));
        assert!(!reader.is_serving());
    }

    #[test]
    fn drain_latches_not_serving() {
        let flag = HealthFlag::new();
        flag.set_serving(true);
        assert!(flag.drain());
        assert!(!flag.is_serving());

        assert!(!flag.set_serving(true));
        assert!(!flag.is_serving());
        assert!(flag.is_draining());
        assert_eq!(flag.status(), HealthStatus::NotServing);
    }

    #[test]
    fn drain_before_bind_blocks_later_serving() {
        let flag = HealthFlag::new();
        assert!(!flag.drain());
        assert!(!flag.set_serving(true));
        assert!(!flag.is_serving());
    }
}
