//! 协程执行上下文
//!
//! 基于 corosensei 的非对称有栈上下文切换：调度器通过 `Body::resume`
//! 切入协程，协程通过 `suspend` 切回调度器

use std::cell::Cell;
use std::mem::ManuallyDrop;
use std::time::Instant;

use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};

use super::stack::{self, StackBounds};
use crate::error::Result;

/// 协程切回调度器的原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    /// 主动让出，重新入队
    Yield,
    /// 阻塞在事件上，由事件的另一方唤醒
    Park,
    /// 睡眠到指定时刻
    Sleep(Instant),
    /// 执行结束
    Exit,
}

type Inner = Coroutine<(), Switch, (), DefaultStack>;

thread_local! {
    /// 当前协程的 Yielder
    ///
    /// 协程开始时写入；每次从 suspend 返回后重新写入，
    /// 因为挂起期间同一线程上的其他协程会覆盖它
    static CURRENT_YIELDER: Cell<Option<*const Yielder<(), Switch>>> = const { Cell::new(None) };
}

/// 协程执行体：协程栈加上下文
pub struct Body {
    coro: ManuallyDrop<Inner>,
    bounds: StackBounds,
}

impl Body {
    /// 在新分配的栈上准备执行体，首次 resume 时执行 `f`
    pub fn new<F>(stack_size: usize, f: F) -> Result<Self>
    where
        F: FnOnce() + 'static,
    {
        let (stack, bounds) = stack::allocate(stack_size)?;
        let coro = Coroutine::with_stack(stack, move |yielder: &Yielder<(), Switch>, ()| {
            CURRENT_YIELDER.with(|c| c.set(Some(yielder as *const Yielder<(), Switch>)));
            f();
        });
        Ok(Self {
            coro: ManuallyDrop::new(coro),
            bounds,
        })
    }

    /// 切入协程，直到它挂起或结束
    pub fn resume(&mut self) -> Switch {
        stack::enter(self.bounds);
        let result = self.coro.resume(());
        stack::leave();
        CURRENT_YIELDER.with(|c| c.set(None));

        match result {
            CoroutineResult::Yield(switch) => switch,
            CoroutineResult::Return(()) => Switch::Exit,
        }
    }

    /// 栈边界
    #[inline]
    pub fn bounds(&self) -> StackBounds {
        self.bounds
    }

    /// 栈溢出魔数是否完好
    #[inline]
    pub fn canary_intact(&self) -> bool {
        self.bounds.canary_intact()
    }

    /// 是否已执行结束
    #[inline]
    pub fn is_done(&self) -> bool {
        self.coro.done()
    }
}

impl Drop for Body {
    fn drop(&mut self) {
        if !self.coro.started() || self.coro.done() {
            // SAFETY: 只在此处释放一次
            unsafe { ManuallyDrop::drop(&mut self.coro) };
        } else {
            // 仍挂起的执行体不能展开其栈（栈上的帧可能在等待其他线程），
            // 直接泄漏，只会发生在死锁或异常关闭时
            tracing::debug!(limit = self.bounds.limit, "leaking suspended coroutine stack");
        }
    }
}

/// 当前是否在协程中执行
pub fn in_coroutine() -> bool {
    CURRENT_YIELDER.with(|c| c.get().is_some())
}

/// 挂起当前协程，切回调度器
///
/// 在协程之外调用时返回 false
pub fn suspend(reason: Switch) -> bool {
    let Some(ptr) = CURRENT_YIELDER.with(|c| c.get()) else {
        return false;
    };
    // SAFETY: 指针由正在运行的协程写入，Yielder 在整个协程体执行期间有效
    let yielder = unsafe { &*ptr };
    yielder.suspend(reason);
    CURRENT_YIELDER.with(|c| c.set(Some(ptr)));
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_body_yield_and_exit() {
        let log = Rc::new(Cell::new(0));
        let inner = Rc::clone(&log);
        let mut body = Body::new(64 * 1024, move || {
            inner.set(1);
            assert!(in_coroutine());
            suspend(Switch::Yield);
            inner.set(2);
            suspend(Switch::Park);
            inner.set(3);
        })
        .unwrap();

        assert_eq!(body.resume(), Switch::Yield);
        assert_eq!(log.get(), 1);
        assert!(!in_coroutine());
        assert_eq!(body.resume(), Switch::Park);
        assert_eq!(log.get(), 2);
        assert_eq!(body.resume(), Switch::Exit);
        assert_eq!(log.get(), 3);
        assert!(body.is_done());
        assert!(body.canary_intact());
    }

    #[test]
    fn test_stack_check_inside_body() {
        let seen = Rc::new(Cell::new(None));
        let inner = Rc::clone(&seen);
        let mut body = Body::new(64 * 1024, move || {
            let left = stack::headroom().unwrap();
            stack::stack_check(crate::config::STACK_CHECK_MARGIN);
            let overflow = std::panic::catch_unwind(|| stack::stack_check(usize::MAX));
            inner.set(Some((left, overflow.is_err())));
        })
        .unwrap();

        let bounds = body.bounds();
        assert_eq!(bounds.size(), 64 * 1024);
        assert!(body.canary_intact());
        assert_eq!(body.resume(), Switch::Exit);

        let (left, overflowed) = seen.get().unwrap();
        assert!(left > 0 && left < bounds.size());
        assert!(overflowed);
        assert!(body.canary_intact());
    }

    #[test]
    fn test_nested_bodies_keep_own_yielder() {
        let mut outer = Body::new(64 * 1024, || {
            suspend(Switch::Yield);
        })
        .unwrap();
        let mut other = Body::new(64 * 1024, || {
            suspend(Switch::Sleep(Instant::now()));
        })
        .unwrap();

        assert_eq!(outer.resume(), Switch::Yield);
        assert!(matches!(other.resume(), Switch::Sleep(_)));
        assert_eq!(outer.resume(), Switch::Exit);
        assert_eq!(other.resume(), Switch::Exit);
    }

    #[test]
    fn test_suspend_outside_coroutine() {
        assert!(!suspend(Switch::Yield));
    }

    #[test]
    fn test_drop_suspended_body() {
        let mut body = Body::new(64 * 1024, || {
            suspend(Switch::Park);
        })
        .unwrap();
        assert_eq!(body.resume(), Switch::Park);
        drop(body);
    }
}
