//! 线程级并行
//!
//! `thrd_async` 在独立的 OS 线程上计算一个值；`thrd_scope` 把任务交给
//! 全局 fork-join 线程池。两者都会阻塞调用它的 OS 线程，
//! 在协程中等待 Future 时可以用 `Future::wait(yielding)` 让出执行权

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex};

use super::context;
use super::value::Value;
use crate::config::{POOL_QUEUE_SIZE, POOL_THREADS_PER_CPU, RUNTIME_NAME};
use crate::error::{panic_message, Result, Rid, RuntimeError};

type Task = Box<dyn FnOnce() + Send + 'static>;
type Outcome = std::result::Result<Value, String>;

/// 轮询等待的间隔
const POLL_INTERVAL: Duration = Duration::from_millis(1);

fn run_caught<F, R>(f: F) -> Outcome
where
    F: FnOnce() -> R,
    R: Into<Value>,
{
    panic::catch_unwind(AssertUnwindSafe(|| f().into())).map_err(|p| panic_message(p.as_ref()))
}

fn into_result(outcome: Outcome) -> Result<Value> {
    outcome.map_err(RuntimeError::TaskPanicked)
}

struct Promise {
    state: Mutex<Option<Outcome>>,
    cond: Condvar,
}

impl Promise {
    fn new() -> Self {
        Self {
            state: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    fn complete(&self, outcome: Outcome) {
        *self.state.lock() = Some(outcome);
        self.cond.notify_all();
    }

    fn is_done(&self) -> bool {
        self.state.lock().is_some()
    }

    /// 等待完成，超时返回 false
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if state.is_none() {
            self.cond.wait_for(&mut state, timeout);
        }
        state.is_some()
    }

    fn take(&self) -> Option<Outcome> {
        let mut state = self.state.lock();
        while state.is_none() {
            self.cond.wait(&mut state);
        }
        state.take()
    }
}

/// 在独立线程上计算的值
pub struct Future {
    promise: Arc<Promise>,
    thread: Option<JoinHandle<()>>,
}

impl Future {
    /// 是否已计算完成
    pub fn is_done(&self) -> bool {
        self.promise.is_done()
    }

    /// 阻塞直到计算完成，取出结果
    pub fn get(mut self) -> Result<Value> {
        let outcome = self.promise.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        into_result(outcome.unwrap_or_else(|| Err("future already taken".to_string())))
    }

    /// 等待完成，每次轮询未完成时调用一次 `yield_fn`
    pub fn wait<Y: FnMut()>(self, mut yield_fn: Y) -> Result<Value> {
        while !self.promise.wait_timeout(POLL_INTERVAL) {
            yield_fn();
        }
        self.get()
    }
}

impl std::fmt::Debug for Future {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future").field("done", &self.is_done()).finish()
    }
}

/// 在新线程上计算 `f`
pub fn thrd_async<F, R>(f: F) -> Result<Future>
where
    F: FnOnce() -> R + Send + 'static,
    R: Into<Value>,
{
    let promise = Arc::new(Promise::new());
    let remote = Arc::clone(&promise);
    let handle = thread::Builder::new()
        .name(format!("{}-future", RUNTIME_NAME))
        .spawn(move || remote.complete(run_caught(f)))
        .map_err(RuntimeError::ThreadSpawn)?;

    Ok(Future {
        promise,
        thread: Some(handle),
    })
}

/// 在新线程上计算 `f(arg)`
pub fn thrd_for<F, A, R>(f: F, arg: A) -> Result<Future>
where
    F: FnOnce(A) -> R + Send + 'static,
    A: Send + 'static,
    R: Into<Value>,
{
    thrd_async(move || f(arg))
}

pub fn thrd_get(future: Future) -> Result<Value> {
    future.get()
}

pub fn thrd_is_done(future: &Future) -> bool {
    future.is_done()
}

pub fn thrd_wait<Y: FnMut()>(future: Future, yield_fn: Y) -> Result<Value> {
    future.wait(yield_fn)
}

/// fork-join 线程池
///
/// 线程按需创建，上限为 CPU 核心数的若干倍；队列满时任务在提交线程上直接执行
struct Pool {
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    idle: Arc<AtomicUsize>,
    max_threads: usize,
}

static POOL: Mutex<Option<Arc<Pool>>> = Mutex::new(None);

fn pool() -> Arc<Pool> {
    let mut slot = POOL.lock();
    Arc::clone(slot.get_or_insert_with(|| Arc::new(Pool::new())))
}

impl Pool {
    fn new() -> Self {
        let (sender, receiver) = bounded(POOL_QUEUE_SIZE);
        Self {
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(Vec::new()),
            idle: Arc::new(AtomicUsize::new(0)),
            max_threads: (num_cpus::get() * POOL_THREADS_PER_CPU).max(2),
        }
    }

    fn submit(&self, task: Task) {
        self.grow();
        let sender = self.sender.lock().clone();
        match sender {
            Some(sender) => match sender.try_send(task) {
                Ok(()) => {}
                Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => task(),
            },
            None => task(),
        }
    }

    /// 没有空闲线程时补充一个工作线程
    fn grow(&self) {
        if self.idle.load(Ordering::Acquire) > 0 {
            return;
        }
        let mut workers = self.workers.lock();
        if workers.len() >= self.max_threads {
            return;
        }

        let id = workers.len();
        let receiver = self.receiver.clone();
        let idle = Arc::clone(&self.idle);
        match thread::Builder::new()
            .name(format!("{}-pool-{}", RUNTIME_NAME, id))
            .spawn(move || worker_loop(receiver, idle))
        {
            Ok(handle) => workers.push(handle),
            Err(e) => tracing::warn!(error = %e, "failed to grow thread pool"),
        }
    }

    /// 在当前线程上执行一个排队中的任务
    fn try_run_one(&self) -> bool {
        match self.receiver.try_recv() {
            Ok(task) => {
                task();
                true
            }
            Err(_) => false,
        }
    }

    fn shutdown(&self) {
        self.sender.lock().take();
        let handles = std::mem::take(&mut *self.workers.lock());
        let count = handles.len();
        for handle in handles {
            let _ = handle.join();
        }
        tracing::debug!(threads = count, "thread pool stopped");
    }
}

fn worker_loop(receiver: Receiver<Task>, idle: Arc<AtomicUsize>) {
    loop {
        idle.fetch_add(1, Ordering::AcqRel);
        let task = receiver.recv();
        idle.fetch_sub(1, Ordering::AcqRel);
        match task {
            Ok(task) => task(),
            Err(_) => break,
        }
    }
}

/// 任务 ID（在所属 Scope 内有效）
pub type TaskId = usize;

struct ScopeState {
    pending: AtomicUsize,
    results: Mutex<Vec<Option<Outcome>>>,
    lock: Mutex<()>,
    cond: Condvar,
}

/// 一组 fork-join 任务
pub struct Scope {
    state: Arc<ScopeState>,
    pool: Arc<Pool>,
}

impl Scope {
    fn new(pool: Arc<Pool>) -> Self {
        Self {
            state: Arc::new(ScopeState {
                pending: AtomicUsize::new(0),
                results: Mutex::new(Vec::new()),
                lock: Mutex::new(()),
                cond: Condvar::new(),
            }),
            pool,
        }
    }

    /// 提交任务
    pub fn spawn<F, R>(&self, f: F) -> TaskId
    where
        F: FnOnce() -> R + Send + 'static,
        R: Into<Value>,
    {
        let id = {
            let mut results = self.state.results.lock();
            results.push(None);
            results.len() - 1
        };
        self.state.pending.fetch_add(1, Ordering::AcqRel);

        let state = Arc::clone(&self.state);
        self.pool.submit(Box::new(move || {
            let outcome = run_caught(f);
            if let Some(slot) = state.results.lock().get_mut(id) {
                *slot = Some(outcome);
            }
            if state.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let _guard = state.lock.lock();
                state.cond.notify_all();
            }
        }));
        id
    }

    /// 等待本 Scope 的所有任务完成
    ///
    /// 不在协程中时，等待期间帮助执行排队中的任务，嵌套的 Scope 不会互相阻塞。
    /// 任一任务 panic 时返回错误
    pub fn sync(&self) -> Result<()> {
        let help = !context::in_coroutine();
        while self.state.pending.load(Ordering::Acquire) > 0 {
            if help && self.pool.try_run_one() {
                continue;
            }
            let mut guard = self.state.lock.lock();
            if self.state.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            self.state.cond.wait_for(&mut guard, POLL_INTERVAL);
        }

        let results = self.state.results.lock();
        if let Some(Err(message)) = results.iter().flatten().find(|o| o.is_err()) {
            return Err(RuntimeError::TaskPanicked(message.clone()));
        }
        Ok(())
    }

    /// 读取任务结果
    pub fn result(&self, id: TaskId) -> Result<Value> {
        match self.state.results.lock().get(id) {
            Some(Some(outcome)) => into_result(outcome.clone()),
            _ => Err(RuntimeError::ResultNotReady(id as Rid)),
        }
    }

    /// 已提交的任务数
    pub fn len(&self) -> usize {
        self.state.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 创建任务组
pub fn thrd_scope() -> Scope {
    Scope::new(pool())
}

pub fn thrd_spawn<F, R>(scope: &Scope, f: F) -> TaskId
where
    F: FnOnce() -> R + Send + 'static,
    R: Into<Value>,
{
    scope.spawn(f)
}

pub fn thrd_sync(scope: &Scope) -> Result<()> {
    scope.sync()
}

pub fn thrd_result(scope: &Scope, id: TaskId) -> Result<Value> {
    scope.result(id)
}

/// 关闭全局线程池，下次使用时重新创建
pub fn thrd_destroy() {
    let pool = POOL.lock().take();
    if let Some(pool) = pool {
        pool.shutdown();
    }
}
