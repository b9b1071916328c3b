//! WaitGroup
//!
//! 协程调用 `waitgroup()` 打开一个组，之后它用 `go()` 创建的协程都加入该组；
//! `waitfor()` 关闭该组并挂起，直到所有成员结束，然后按加入顺序收集成员的结果 ID

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::local;
use super::routine::{Co, RoutineStatus};
use super::scheduler::Scheduler;
use super::spin::SpinLock;
use crate::error::{Cid, Rid};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Default)]
struct GroupState {
    /// 成员（按加入顺序）
    members: Vec<Co>,
    /// 尚未结束的成员数
    pending: usize,
    /// 挂起等待的协程
    waiter: Option<(Arc<Scheduler>, Co)>,
}

/// 协程组
pub struct WaitGroup {
    pub id: u64,
    /// 打开该组的协程
    pub owner: Cid,
    state: SpinLock<GroupState>,
    closed: AtomicBool,
    failed: AtomicBool,
}

impl WaitGroup {
    pub fn new(owner: Cid) -> Self {
        Self {
            id: NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed),
            owner,
            state: SpinLock::default(),
            closed: AtomicBool::new(false),
            failed: AtomicBool::new(false),
        }
    }

    /// 加入成员
    pub(crate) fn add(&self, co: &Co) {
        let mut state = self.state.lock();
        state.members.push(Arc::clone(co));
        state.pending += 1;
    }

    /// 成员结束
    pub(crate) fn member_done(&self, co: &Co) {
        if co.is_flagged() {
            self.failed.store(true, Ordering::Release);
        }
        let waiter = {
            let mut state = self.state.lock();
            state.pending = state.pending.saturating_sub(1);
            if state.pending == 0 {
                state.waiter.take()
            } else {
                None
            }
        };
        if let Some((sched, waiter)) = waiter {
            sched.wake(waiter);
        }
    }

    /// 注册等待者，仍有未结束的成员时返回 true（调用方随后挂起）
    fn register_waiter(&self, sched: &Arc<Scheduler>, co: &Co) -> bool {
        let mut state = self.state.lock();
        if state.pending == 0 {
            return false;
        }
        sched.prepare_park(co);
        state.waiter = Some((Arc::clone(sched), Arc::clone(co)));
        true
    }

    /// 关闭该组，之后创建的协程不再加入
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 是否有成员以 panic 结束
    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// 成员数
    pub fn len(&self) -> usize {
        self.state.lock().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 尚未结束的成员数
    pub fn pending(&self) -> usize {
        self.state.lock().pending
    }

    /// 按加入顺序收集正常结束的成员的结果 ID，有成员失败时返回 None
    fn harvest(&self) -> Option<Vec<Rid>> {
        let members = std::mem::take(&mut self.state.lock().members);
        if self.is_failed() {
            return None;
        }
        Some(
            members
                .iter()
                .filter(|co| co.status() == RoutineStatus::Dead && co.is_ready())
                .filter_map(|co| co.rid)
                .collect(),
        )
    }
}

impl std::fmt::Debug for WaitGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGroup")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("closed", &self.is_closed())
            .field("failed", &self.is_failed())
            .finish()
    }
}

/// 在当前协程上打开一个新的 WaitGroup
///
/// 之前打开的组被关闭。在协程之外调用会 panic
pub fn waitgroup() -> Arc<WaitGroup> {
    let Some((sched, co)) = local::current_context() else {
        panic!("logic error: waitgroup called outside of a coroutine runtime");
    };
    sched.mark_waitable();
    let wg = Arc::new(WaitGroup::new(co.cid));
    if let Some(prev) = co.replace_open_group(Some(Arc::clone(&wg))) {
        prev.close();
    }
    wg
}

/// 等待组内所有成员结束
///
/// 返回按加入顺序排列的结果 ID；任一成员以 panic 结束时返回 None
pub fn waitfor(wg: &Arc<WaitGroup>) -> Option<Vec<Rid>> {
    let Some((sched, co)) = local::current_context() else {
        panic!("logic error: waitfor called outside of a coroutine runtime");
    };

    if co
        .open_group()
        .map(|open| Arc::ptr_eq(&open, wg))
        .unwrap_or(false)
    {
        co.replace_open_group(None);
    }
    wg.close();

    if wg.register_waiter(&sched, &co) {
        co.set_state(format!("waitfor group {}", wg.id));
        local::park();
        co.set_state("");
    }
    wg.harvest()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::routine::RunMode;
    use crate::runtime::RuntimeConfig;
    use crate::runtime::value::Value;

    #[test]
    fn test_member_bookkeeping() {
        let sched = Scheduler::new(RuntimeConfig::default().with_threads(1));
        let wg = WaitGroup::new(0);
        let a = sched.create(RunMode::Normal, 0, None);
        let b = sched.create(RunMode::Normal, 0, None);
        wg.add(&a);
        wg.add(&b);
        assert_eq!(wg.len(), 2);
        assert_eq!(wg.pending(), 2);

        sched.results().publish(b.rid.unwrap(), Value::Int(2));
        b.mark_ready();
        b.halt(false);
        wg.member_done(&b);
        sched.results().publish(a.rid.unwrap(), Value::Int(1));
        a.mark_ready();
        a.halt(false);
        wg.member_done(&a);

        assert_eq!(wg.pending(), 0);
        assert_eq!(wg.harvest(), Some(vec![a.rid.unwrap(), b.rid.unwrap()]));
    }

    #[test]
    fn test_failed_member() {
        let sched = Scheduler::new(RuntimeConfig::default().with_threads(1));
        let wg = WaitGroup::new(0);
        let a = sched.create(RunMode::Normal, 0, None);
        wg.add(&a);
        a.halt(true);
        wg.member_done(&a);
        assert!(wg.is_failed());
        assert_eq!(wg.harvest(), None);
    }

    #[test]
    fn test_no_wait_when_empty() {
        let sched = Arc::new(Scheduler::new(RuntimeConfig::default().with_threads(1)));
        let wg = WaitGroup::new(0);
        let co = sched.create(RunMode::Normal, 0, None);
        assert!(!wg.register_waiter(&sched, &co));
        assert_eq!(sched.blocked(), 0);
    }

    #[test]
    #[should_panic(expected = "waitgroup called outside")]
    fn test_waitgroup_outside_runtime() {
        waitgroup();
    }
}
