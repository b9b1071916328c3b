//! 运行时错误类型

use std::any::Any;
use std::io;

use thiserror::Error;

/// 协程 ID
pub type Cid = u64;
/// 结果 ID
pub type Rid = u64;

/// 运行时错误
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// 所有存活协程都阻塞在事件上，没有任何可运行的协程
    #[error("coroutines stalled: {active} active, none runnable")]
    Deadlock { active: usize },

    /// 协程发生未恢复的 panic
    #[error("coroutine {cid} panicked: {message}")]
    Panicked { cid: Cid, message: String },

    /// 协程栈剩余空间不足
    #[error("coroutine {cid} stack overflow ({headroom} bytes left)")]
    StackOverflow { cid: Cid, headroom: usize },

    /// 协程栈分配失败
    #[error("failed to allocate coroutine stack: {0}")]
    StackAlloc(#[source] io::Error),

    /// 工作线程创建失败
    #[error("failed to spawn thread: {0}")]
    ThreadSpawn(#[source] io::Error),

    /// Channel 已被释放
    #[error("channel {0} has been freed")]
    ChannelFreed(u64),

    /// 在协程运行时之外调用了需要运行时的操作
    #[error("{0} called outside of a coroutine runtime")]
    OutsideRuntime(&'static str),

    /// 当前线程上已经有运行时在运行
    #[error("a coroutine runtime is already running on this thread")]
    AlreadyRunning,

    /// 线程级任务发生 panic
    #[error("task panicked: {0}")]
    TaskPanicked(String),

    /// 结果尚未就绪
    #[error("result {0} is not ready")]
    ResultNotReady(Rid),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// 从 panic 负载中提取消息
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload = std::panic::catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "boom");

        let payload = std::panic::catch_unwind(|| panic!("code {}", 7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "code 7");
    }

    #[test]
    fn test_error_display() {
        let err = RuntimeError::Deadlock { active: 3 };
        assert_eq!(err.to_string(), "coroutines stalled: 3 active, none runnable");
        assert_eq!(RuntimeError::ChannelFreed(9).to_string(), "channel 9 has been freed");
    }
}
