//! 线程本地调度器
//!
//! 每个调度线程持有一个 `LocalScheduler`：运行队列、睡眠队列、
//! 可窃取队列的所有者端，以及本线程上已开始运行的协程的执行体。
//! 执行体不能跨线程，协程一旦开始运行就固定在所属线程上

use std::cell::RefCell;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;

use super::channel;
use super::context::{self, Body, Switch};
use super::deque::{Owner, Steal};
use super::processor::{Processor, ProcessorStatus};
use super::queue::{RunQueue, SleepQueue};
use super::routine::{Co, Entry, RoutineStatus, RunMode};
use super::scheduler::Scheduler;
use super::value::Value;
use crate::config::{DEADLOCK_GRACE, IDLE_PARK};
use crate::error::{panic_message, Cid, Result, Rid, RuntimeError};

thread_local! {
    static LOCAL: RefCell<Option<LocalScheduler>> = const { RefCell::new(None) };
}

/// 线程本地调度器
pub(crate) struct LocalScheduler {
    sched: Arc<Scheduler>,
    tid: usize,
    processor: Arc<Processor>,
    /// 可窃取队列（新创建、尚未运行的协程）
    deque: Owner<Co>,
    /// 可运行队列
    run_queue: RunQueue,
    /// 睡眠队列
    sleep_queue: SleepQueue,
    /// 已开始运行的协程的执行体
    bodies: HashMap<Cid, Body>,
    /// 正在运行的协程
    current: Option<Co>,
    /// 上一个运行的协程
    previous: Option<Co>,
    /// 睡眠驱动协程
    sleeper: Option<Co>,
    /// 全部协程阻塞的起始时刻与当时的交汇计数（仅主线程使用）
    stall: Option<(Instant, u64)>,
}

/// 调度循环的下一步
enum Step {
    Run(Co, Body),
    Idle,
    Exit(Result<()>),
}

fn with_local<R>(f: impl FnOnce(&mut LocalScheduler) -> R) -> Option<R> {
    LOCAL.with(|cell| cell.borrow_mut().as_mut().map(f))
}

/// 在当前线程上安装调度器
pub(crate) fn install(sched: Arc<Scheduler>, tid: usize) -> Result<()> {
    if LOCAL.with(|cell| cell.borrow().is_some()) {
        return Err(RuntimeError::AlreadyRunning);
    }
    let processor = sched
        .processor(tid)
        .cloned()
        .ok_or(RuntimeError::OutsideRuntime("install"))?;
    let deque = sched.take_owner(tid).ok_or(RuntimeError::AlreadyRunning)?;

    let local = LocalScheduler {
        sched,
        tid,
        processor,
        deque,
        run_queue: RunQueue::new(),
        sleep_queue: SleepQueue::new(),
        bodies: HashMap::new(),
        current: None,
        previous: None,
        sleeper: None,
        stall: None,
    };
    LOCAL.with(|cell| *cell.borrow_mut() = Some(local));
    Ok(())
}

/// 卸载当前线程的调度器
///
/// 仍挂起的执行体在这里被释放（泄漏其栈）
pub(crate) fn uninstall() {
    let local = LOCAL.with(|cell| cell.borrow_mut().take());
    if let Some(mut local) = local {
        local.teardown();
        local.processor.set_status(ProcessorStatus::Exited);
    }
}

/// 从另一个调度器线程的角度：若当前线程就是协程的所属线程，直接放入运行队列
pub(crate) fn push_local(sched: &Scheduler, co: Co) -> std::result::Result<(), Co> {
    LOCAL.with(|cell| match cell.try_borrow_mut() {
        Ok(mut slot) => match slot.as_mut() {
            Some(local) if std::ptr::eq(Arc::as_ptr(&local.sched), sched) && local.tid == co.tid() => {
                local.run_queue.push(co);
                Ok(())
            }
            _ => Err(co),
        },
        Err(_) => Err(co),
    })
}

/// 放入初始协程
pub(crate) fn push_runnable(co: Co) {
    with_local(|l| l.run_queue.push(co));
}

impl LocalScheduler {
    /// 放置新创建的协程
    ///
    /// 多线程时可迁移的协程进入可窃取队列并唤醒一个空闲线程，
    /// 其余的进入本地运行队列
    fn place(&mut self, co: Co) {
        if self.sched.threading() && co.is_stealable() {
            self.deque.push(co);
            self.sched.unpark_idle(self.tid);
        } else {
            self.run_queue.push(co);
        }
    }

    /// 取出可窃取队列中的全部协程，按创建顺序放入运行队列
    fn pull_deque(&mut self) {
        let mut taken = Vec::new();
        loop {
            match self.deque.take() {
                Steal::Success(co) => taken.push(co),
                Steal::Aborted | Steal::Empty => break,
            }
        }
        for co in taken.into_iter().rev() {
            self.run_queue.push(co);
        }
    }

    /// 取出或创建协程的执行体
    fn prepare(&mut self, co: &Co) -> Option<Body> {
        if co.is_terminal() {
            tracing::warn!(cid = co.cid, "terminated coroutine found in run queue");
            return None;
        }
        if let Some(body) = self.bodies.remove(&co.cid) {
            return Some(body);
        }
        if co.is_started() {
            tracing::error!(cid = co.cid, tid = self.tid, "no execution body for started coroutine");
            return None;
        }

        let prepared = match co.start(self.tid) {
            Some(entry) => Body::new(co.stack_size, trampoline(Arc::clone(&self.sched), Arc::clone(co), entry)),
            None => Err(RuntimeError::Panicked {
                cid: co.cid,
                message: "coroutine has no entry".to_string(),
            }),
        };
        match prepared {
            Ok(body) => {
                if co.mode.is_counted() {
                    self.processor.inc_used();
                }
                Some(body)
            }
            Err(e) => {
                tracing::error!(cid = co.cid, error = %e, "failed to prepare coroutine");
                co.set_error(e.to_string());
                co.halt(true);
                self.sched.retire(co);
                None
            }
        }
    }

    fn next_step(&mut self, is_main: bool) -> Step {
        if !self.sched.is_errorless() {
            return Step::Exit(if is_main {
                Err(self.sched.take_failure())
            } else {
                Ok(())
            });
        }
        if !is_main && self.sched.is_finished() {
            return Step::Exit(Ok(()));
        }

        for co in self.processor.drain_inbox() {
            self.run_queue.push(co);
        }
        if self.run_queue.is_empty() {
            self.pull_deque();
        }

        while let Some(co) = self.run_queue.pop() {
            if let Some(body) = self.prepare(&co) {
                co.set_status(RoutineStatus::Running);
                co.inc_cycles();
                self.processor.inc_schedule_count();
                self.current = Some(Arc::clone(&co));
                self.stall = None;
                return Step::Run(co, body);
            }
        }

        if is_main {
            let (active, blocked) = self.sched.load();
            if active == 0 {
                return Step::Exit(Ok(()));
            }
            if blocked == active && channel::external_waiters() == 0 {
                // 持续阻塞且期间没有任何交汇完成才判定为死锁
                let mark = channel::transfers();
                match self.stall {
                    Some((since, seen)) if seen == mark => {
                        if since.elapsed() >= DEADLOCK_GRACE {
                            return Step::Exit(Err(RuntimeError::Deadlock { active }));
                        }
                    }
                    _ => self.stall = Some((Instant::now(), mark)),
                }
            } else {
                self.stall = None;
            }
        }
        Step::Idle
    }

    /// 处理协程切回调度器的结果，返回协程是否已结束
    fn after_switch(&mut self, co: &Co, body: Body, switch: Switch) -> bool {
        self.previous = self.current.take();
        match switch {
            Switch::Yield => {
                co.cas_status(RoutineStatus::Running, RoutineStatus::Normal);
                self.bodies.insert(co.cid, body);
                self.run_queue.push(Arc::clone(co));
                false
            }
            Switch::Park => {
                // 状态已在注册等待时设为 Event，唤醒方可能已经把它投递回来
                self.bodies.insert(co.cid, body);
                false
            }
            Switch::Sleep(deadline) => {
                co.cas_status(RoutineStatus::Running, RoutineStatus::Event);
                self.bodies.insert(co.cid, body);
                self.sleep_queue.insert(deadline, Arc::clone(co));
                self.ensure_sleeper();
                false
            }
            Switch::Exit => {
                drop(body);
                if co.mode == RunMode::System {
                    self.sleeper = None;
                } else {
                    self.processor.dec_used();
                }
                true
            }
        }
    }

    /// 确保本线程有睡眠驱动协程
    fn ensure_sleeper(&mut self) {
        if self.sleeper.is_some() {
            return;
        }
        let co = self
            .sched
            .create(RunMode::System, self.tid, Some(Box::new(sleep_driver)));
        co.set_name(format!("sleeper-{}", self.tid));
        self.sleeper = Some(Arc::clone(&co));
        self.run_queue.push(co);
    }

    /// 将到期的睡眠协程移入运行队列，返回下一个唤醒时间
    fn wake_sleepers(&mut self) -> Option<Instant> {
        for co in self.sleep_queue.pop_expired(Instant::now()) {
            co.cas_status(RoutineStatus::Event, RoutineStatus::Normal);
            self.run_queue.push(co);
        }
        self.sleep_queue.next_deadline()
    }

    /// 除睡眠驱动外本线程没有任何可做的事
    fn is_idle(&self) -> bool {
        self.run_queue.is_empty() && self.deque.is_empty() && self.processor.inbox_is_empty()
    }

    fn teardown(&mut self) {
        let mut pending = self.run_queue.drain().len() + self.sleep_queue.drain().len();
        loop {
            match self.deque.take() {
                Steal::Success(_) => pending += 1,
                Steal::Aborted | Steal::Empty => break,
            }
        }
        pending += self.processor.drain_inbox().len();
        let suspended = self.bodies.len();
        self.bodies.clear();
        self.current = None;
        self.previous = None;
        self.sleeper = None;
        if pending > 0 || suspended > 0 {
            tracing::debug!(tid = self.tid, pending, suspended, "discarding unfinished coroutines");
        }
    }
}

/// 协程入口：捕获 panic，执行延迟清理，发布结果
fn trampoline(sched: Arc<Scheduler>, co: Co, entry: Entry) -> impl FnOnce() + 'static {
    move || {
        let outcome = panic::catch_unwind(AssertUnwindSafe(entry));

        for deferred in co.take_defers() {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(deferred)) {
                tracing::warn!(cid = co.cid, message = %panic_message(payload.as_ref()), "deferred call panicked");
            }
        }

        match outcome {
            Ok(value) => {
                if let Some(rid) = co.rid {
                    sched.results().publish(rid, value);
                    co.mark_ready();
                }
                co.halt(false);
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                tracing::error!(cid = co.cid, %message, "coroutine panicked");
                co.set_error(message);
                co.halt(true);
            }
        }
    }
}

/// 睡眠驱动
///
/// 系统协程：唤醒到期的睡眠协程；本线程没有其他工作时，
/// 让 OS 线程休眠到下一个唤醒时间。睡眠队列为空时退出
fn sleep_driver() -> Value {
    loop {
        let Some((next, idle, processor)) =
            with_local(|l| (l.wake_sleepers(), l.is_idle(), Arc::clone(&l.processor)))
        else {
            break;
        };
        let Some(deadline) = next else {
            break;
        };
        if idle {
            processor.park_until(deadline);
        }
        yielding();
    }
    Value::Null
}

/// 调度循环
///
/// 主线程 (`is_main`) 在没有任何存活协程时正常退出，
/// 在所有存活协程都阻塞时报告死锁；工作线程在运行时结束时退出
pub(crate) fn run_loop(is_main: bool) -> Result<()> {
    let (sched, processor) = with_local(|l| (Arc::clone(&l.sched), Arc::clone(&l.processor)))
        .ok_or(RuntimeError::OutsideRuntime("run_loop"))?;
    processor.mark_started();
    processor.set_status(ProcessorStatus::Running);

    let result = loop {
        let step = match with_local(|l| l.next_step(is_main)) {
            Some(step) => step,
            None => break Err(RuntimeError::OutsideRuntime("run_loop")),
        };

        match step {
            Step::Run(co, mut body) => {
                let switch = body.resume();
                if !body.canary_intact() {
                    let err = RuntimeError::StackOverflow { cid: co.cid, headroom: 0 };
                    tracing::error!(error = %err, "stack canary overwritten, aborting process");
                    std::process::abort();
                }
                let exited = with_local(|l| l.after_switch(&co, body, switch)).unwrap_or(true);
                if exited {
                    sched.retire(&co);
                }
            }
            Step::Idle => {
                processor.set_status(ProcessorStatus::Stealing);
                match sched.steal(processor.id) {
                    Some(co) => push_runnable(co),
                    None => processor.park_timeout(IDLE_PARK),
                }
                processor.set_status(ProcessorStatus::Running);
            }
            Step::Exit(result) => break result,
        }
    };

    processor.set_status(ProcessorStatus::Draining);
    result
}

/// 工作线程入口
pub(crate) fn worker_main(sched: Arc<Scheduler>, tid: usize) -> Result<()> {
    let backoff = Backoff::new();
    while !sched.is_started() {
        if sched.is_finished() {
            return Ok(());
        }
        backoff.snooze();
    }

    install(Arc::clone(&sched), tid)?;
    tracing::debug!(machine = tid, "machine started");
    let result = run_loop(false);
    uninstall();
    tracing::debug!(machine = tid, "machine stopped");
    result
}

/// 当前协程
pub fn current() -> Option<Co> {
    with_local(|l| l.current.clone()).flatten()
}

/// 当前线程上一个运行的协程
pub fn previous() -> Option<Co> {
    with_local(|l| l.previous.clone()).flatten()
}

/// 当前协程 ID
pub fn coro_id() -> Option<Cid> {
    current().map(|co| co.cid)
}

/// 当前线程所属的调度器
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    with_local(|l| Arc::clone(&l.sched))
}

/// 当前调度器和当前协程（仅在协程中）
pub(crate) fn current_context() -> Option<(Arc<Scheduler>, Co)> {
    with_local(|l| l.current.clone().map(|co| (Arc::clone(&l.sched), co))).flatten()
}

/// 存活协程数（运行时之外为 0）
pub fn coro_active() -> usize {
    current_scheduler().map(|s| s.active()).unwrap_or(0)
}

/// 让出执行权，重新排到运行队列末尾
///
/// 在协程之外调用时让出 OS 线程
pub fn yielding() {
    if !context::suspend(Switch::Yield) {
        thread::yield_now();
    }
}

/// 睡眠指定毫秒数，0 等价于 `yielding`
///
/// 在协程之外调用时阻塞 OS 线程
pub fn sleepfor(ms: u64) {
    if ms == 0 {
        yielding();
        return;
    }
    let duration = Duration::from_millis(ms);
    if !context::suspend(Switch::Sleep(Instant::now() + duration)) {
        thread::sleep(duration);
    }
}

/// 挂起当前协程直到被事件唤醒
///
/// 调用前必须已经通过 `Scheduler::prepare_park` 注册
pub(crate) fn park() {
    context::suspend(Switch::Park);
}

fn spawn<F, R>(mode: RunMode, what: &'static str, f: F) -> Result<Co>
where
    F: FnOnce() -> R + Send + 'static,
    R: Into<Value>,
{
    let (sched, tid, parent) = with_local(|l| (Arc::clone(&l.sched), l.tid, l.current.clone()))
        .ok_or(RuntimeError::OutsideRuntime(what))?;

    let entry: Entry = Box::new(move || f().into());
    let co = sched.create(mode, tid, Some(entry));

    if mode == RunMode::Normal {
        if let Some(group) = parent
            .as_ref()
            .and_then(|p| p.open_group())
            .filter(|g| !g.is_closed())
        {
            group.add(&co);
            co.set_group(group);
        }
    }

    with_local(|l| l.place(Arc::clone(&co)));
    Ok(co)
}

/// 创建协程
///
/// 若当前协程打开了 WaitGroup，新协程自动加入该组。
/// 在运行时之外调用会 panic
pub fn go<F, R>(f: F) -> Co
where
    F: FnOnce() -> R + Send + 'static,
    R: Into<Value>,
{
    spawn(RunMode::Normal, "go", f).unwrap_or_else(|e| panic!("logic error: {}", e))
}

/// 创建异步协程，返回结果 ID
pub fn launch<F, R>(f: F) -> Rid
where
    F: FnOnce() -> R + Send + 'static,
    R: Into<Value>,
{
    let co = spawn(RunMode::Async, "launch", f).unwrap_or_else(|e| panic!("logic error: {}", e));
    co.rid.expect("async coroutines always carry a result id")
}

/// 注册延迟清理函数，在当前协程结束时按后进先出执行（panic 时也会执行）
pub fn defer<F>(f: F)
where
    F: FnOnce() + Send + 'static,
{
    match current() {
        Some(co) => co.push_defer(Box::new(f)),
        None => panic!("logic error: defer called outside of a coroutine runtime"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_runtime() {
        assert!(current().is_none());
        assert!(coro_id().is_none());
        assert!(current_scheduler().is_none());
        assert_eq!(coro_active(), 0);
        // 协程之外退化为线程操作
        yielding();
        sleepfor(1);
    }

    #[test]
    #[should_panic(expected = "called outside of a coroutine runtime")]
    fn test_go_outside_runtime_panics() {
        go(|| 1);
    }

    #[test]
    fn test_push_local_without_scheduler() {
        let sched = Scheduler::new(crate::runtime::RuntimeConfig::default().with_threads(1));
        let co = sched.create(RunMode::Normal, 0, None);
        assert!(push_local(&sched, co).is_err());
    }

    #[test]
    fn test_install_twice_fails() {
        let sched = Arc::new(Scheduler::new(crate::runtime::RuntimeConfig::default().with_threads(2)));
        install(Arc::clone(&sched), 0).unwrap();
        assert!(matches!(install(Arc::clone(&sched), 1), Err(RuntimeError::AlreadyRunning)));
        assert!(current_scheduler().is_some());
        uninstall();
        assert!(current_scheduler().is_none());
    }
}
