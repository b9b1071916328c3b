//! 调度器 (Scheduler)
//!
//! 一次运行时会话中所有线程共享的状态：处理器表、协程计数、
//! 结果表和运行标志。线程自己的队列在 `local` 模块中

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use rand::Rng;

use super::deque::{Owner, Steal};
use super::local;
use super::processor::{Processor, ProcessorStatus};
use super::result::ResultTable;
use super::routine::{Co, Entry, RoutineStatus, RunMode, Routine};
use super::runtime::RuntimeConfig;
use crate::error::RuntimeError;

const ACTIVE_ONE: u64 = 1 << 32;
const BLOCKED_MASK: u64 = 0xFFFF_FFFF;

/// 存活/阻塞协程计数
///
/// 两个计数打包在同一个原子变量中（高 32 位为存活数，低 32 位为阻塞数），
/// 死锁检测读到的总是一致的快照
#[derive(Debug, Default)]
struct Load(AtomicU64);

impl Load {
    #[inline]
    fn snapshot(&self) -> (usize, usize) {
        let v = self.0.load(Ordering::SeqCst);
        ((v >> 32) as usize, (v & BLOCKED_MASK) as usize)
    }

    #[inline]
    fn add_active(&self) {
        self.0.fetch_add(ACTIVE_ONE, Ordering::SeqCst);
    }

    #[inline]
    fn sub_active(&self) {
        self.0.fetch_sub(ACTIVE_ONE, Ordering::SeqCst);
    }

    #[inline]
    fn add_blocked(&self) -> (usize, usize) {
        let v = self.0.fetch_add(1, Ordering::SeqCst) + 1;
        ((v >> 32) as usize, (v & BLOCKED_MASK) as usize)
    }

    #[inline]
    fn sub_blocked(&self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 调度器
pub struct Scheduler {
    /// 运行时配置
    config: RuntimeConfig,
    /// 处理器列表，下标即线程序号
    processors: Vec<Arc<Processor>>,
    /// 各线程可窃取队列的所有者端，线程启动时取走
    owners: Mutex<Vec<Option<Owner<Co>>>>,
    /// 下一个协程 ID
    next_cid: AtomicU64,
    /// 下一个结果 ID
    next_rid: AtomicU64,
    /// 存活/阻塞计数
    load: Load,
    /// 所有线程已启动
    is_started: AtomicBool,
    /// 运行时正在结束
    is_finish: AtomicBool,
    /// 尚未发生未恢复的错误
    is_errorless: AtomicBool,
    /// 是否使用过 WaitGroup
    is_waitable: AtomicBool,
    /// 导致运行时中止的第一个错误
    failure: Mutex<Option<RuntimeError>>,
    /// 协程结果表
    results: ResultTable,
    /// 已结束但仍被外部引用的协程
    gc: Mutex<Vec<Co>>,
    /// 启动时间
    start_time: Instant,
}

impl Scheduler {
    /// 创建调度器，为每个线程准备一个处理器
    pub fn new(config: RuntimeConfig) -> Self {
        let threads = config.threads.max(1);
        let mut processors = Vec::with_capacity(threads);
        let mut owners = Vec::with_capacity(threads);
        for id in 0..threads {
            let (p, owner) = Processor::new(id, config.queue_size);
            processors.push(Arc::new(p));
            owners.push(Some(owner));
        }

        Self {
            config,
            processors,
            owners: Mutex::new(owners),
            next_cid: AtomicU64::new(1),
            next_rid: AtomicU64::new(1),
            load: Load::default(),
            is_started: AtomicBool::new(false),
            is_finish: AtomicBool::new(false),
            is_errorless: AtomicBool::new(true),
            is_waitable: AtomicBool::new(false),
            failure: Mutex::new(None),
            results: ResultTable::new(),
            gc: Mutex::new(Vec::new()),
            start_time: Instant::now(),
        }
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 线程数（含主线程）
    #[inline]
    pub fn num_threads(&self) -> usize {
        self.processors.len()
    }

    /// 获取处理器
    pub fn processor(&self, id: usize) -> Option<&Arc<Processor>> {
        self.processors.get(id)
    }

    /// 取走线程的可窃取队列所有者端（每个线程只能取一次）
    pub(crate) fn take_owner(&self, id: usize) -> Option<Owner<Co>> {
        self.owners.lock().get_mut(id).and_then(Option::take)
    }

    /// 是否以多线程方式分发新协程
    #[inline]
    pub fn threading(&self) -> bool {
        self.processors.len() > 1 && self.config.stealing && self.is_started()
    }

    /// 标记所有线程已启动
    pub fn start(&self) {
        self.is_started.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.is_started.load(Ordering::Acquire)
    }

    /// 通知所有线程结束
    pub fn finish(&self) {
        self.is_finish.store(true, Ordering::Release);
        self.unpark_all();
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.is_finish.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_errorless(&self) -> bool {
        self.is_errorless.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_waitable(&self) -> bool {
        self.is_waitable.load(Ordering::Acquire)
    }

    pub(crate) fn mark_waitable(&self) {
        self.is_waitable.store(true, Ordering::Release);
    }

    /// 记录错误并让所有线程退出
    pub fn abort(&self, err: RuntimeError) {
        tracing::error!(error = %err, "runtime aborting");
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(err);
            }
        }
        self.is_errorless.store(false, Ordering::Release);
        self.unpark_all();
    }

    /// 取出导致中止的错误
    pub(crate) fn take_failure(&self) -> RuntimeError {
        self.failure.lock().take().unwrap_or(RuntimeError::Panicked {
            cid: 0,
            message: "runtime aborted".to_string(),
        })
    }

    /// 创建协程记录
    ///
    /// 计入存活统计的协程从创建起计数，直到 `retire`
    pub fn create(&self, mode: RunMode, tid: usize, entry: Option<Entry>) -> Co {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        let rid = mode
            .has_result()
            .then(|| self.next_rid.fetch_add(1, Ordering::Relaxed));
        if let Some(rid) = rid {
            self.results.reserve(rid);
        }
        if mode.is_counted() {
            self.load.add_active();
        }
        Arc::new(Routine::new(cid, rid, mode, tid, self.config.stack_size, entry))
    }

    /// 存活协程数
    #[inline]
    pub fn active(&self) -> usize {
        self.load.snapshot().0
    }

    /// 阻塞在事件上的协程数
    #[inline]
    pub fn blocked(&self) -> usize {
        self.load.snapshot().1
    }

    /// 存活数与阻塞数的一致快照
    #[inline]
    pub fn load(&self) -> (usize, usize) {
        self.load.snapshot()
    }

    /// 协程即将阻塞在事件上
    ///
    /// 必须在等待记录对唤醒方可见之前调用（即持有事件锁时），
    /// 随后释放锁并挂起
    pub(crate) fn prepare_park(&self, co: &Co) {
        co.set_status(RoutineStatus::Event);
        let (active, blocked) = self.load.add_blocked();
        if active == blocked {
            self.notify_main();
        }
    }

    /// 唤醒阻塞在事件上的协程
    pub fn wake(&self, co: Co) {
        if co.cas_status(RoutineStatus::Event, RoutineStatus::Normal) {
            self.load.sub_blocked();
            self.ready(co);
        } else {
            tracing::warn!(cid = co.cid, status = ?co.status(), "wake on a coroutine that is not parked");
        }
    }

    /// 将可运行的协程交给其所属线程
    pub(crate) fn ready(&self, co: Co) {
        let tid = co.tid();
        if let Err(co) = local::push_local(self, co) {
            match self.processors.get(tid) {
                Some(p) => p.deliver(co),
                None => tracing::error!(cid = co.cid, tid, "coroutine owned by unknown thread"),
            }
        }
    }

    /// 为空闲线程窃取一个协程
    ///
    /// 从随机位置开始轮询其他线程的可窃取队列
    pub fn steal(&self, thief: usize) -> Option<Co> {
        let n = self.processors.len();
        if n < 2 || !self.config.stealing {
            return None;
        }

        let start = rand::thread_rng().gen_range(0..n);
        let backoff = Backoff::new();
        for i in 0..n {
            let victim = (start + i) % n;
            if victim == thief {
                continue;
            }
            loop {
                match self.processors[victim].stealer().steal() {
                    Steal::Success(co) => {
                        if co.migrate(thief) {
                            return Some(co);
                        }
                        // 已开始运行的协程固定在原线程上
                        self.ready(co);
                        break;
                    }
                    Steal::Aborted => backoff.spin(),
                    Steal::Empty => break,
                }
            }
        }
        None
    }

    /// 唤醒一个空闲线程
    pub(crate) fn unpark_idle(&self, except: usize) {
        for p in &self.processors {
            if p.id != except && p.is_idle() {
                p.unpark();
                break;
            }
        }
    }

    /// 唤醒所有线程
    pub fn unpark_all(&self) {
        for p in &self.processors {
            p.unpark();
        }
    }

    /// 唤醒主线程（进行退出或死锁检查）
    fn notify_main(&self) {
        if let Some(p) = self.processors.first() {
            p.unpark();
        }
    }

    /// 协程执行体已结束，完成收尾工作
    ///
    /// 先通知 WaitGroup（可能唤醒等待者），再减少存活计数，
    /// 保证死锁检测不会在唤醒前看到存活数等于阻塞数
    pub(crate) fn retire(&self, co: &Co) {
        if co.is_flagged() {
            if let Some(rid) = co.rid {
                self.results.fail(rid);
            }
        }

        let group = co.group();
        if let Some(group) = &group {
            group.member_done(co);
        }

        if co.is_flagged() {
            let message = co.error().unwrap_or_default();
            // 等待组成员与 launch 出的协程由等待方处理失败
            if co.mode == RunMode::Async {
                tracing::warn!(cid = co.cid, %message, "launched coroutine failed");
            } else if group.is_some() && co.mode != RunMode::Main {
                tracing::warn!(cid = co.cid, %message, "grouped coroutine failed");
            } else {
                self.abort(RuntimeError::Panicked { cid: co.cid, message });
            }
        }

        if co.mode.is_counted() {
            self.load.sub_active();
        }
        if co.is_referenced() {
            self.gc.lock().push(Arc::clone(co));
        }

        let (active, blocked) = self.load.snapshot();
        if active == 0 || active == blocked {
            self.notify_main();
        }
    }

    /// 结果表
    #[inline]
    pub fn results(&self) -> &ResultTable {
        &self.results
    }

    /// 释放不再被外部引用的已结束协程，返回释放数量
    pub fn collect_garbage(&self) -> usize {
        let mut gc = self.gc.lock();
        let before = gc.len();
        gc.retain(|co| co.is_referenced());
        before - gc.len()
    }

    /// 获取运行时间
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 获取调度统计信息
    pub fn stats(&self) -> SchedulerStats {
        let (active, blocked) = self.load.snapshot();
        SchedulerStats {
            active,
            blocked,
            processors: self
                .processors
                .iter()
                .map(|p| ProcessorStats {
                    id: p.id,
                    status: p.status(),
                    queue_len: p.queue_len(),
                    used: p.used(),
                    schedule_count: p.schedule_count(),
                })
                .collect(),
            results: self.results.len(),
            referenced: self.gc.lock().len(),
            elapsed: self.elapsed(),
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (active, blocked) = self.load.snapshot();
        f.debug_struct("Scheduler")
            .field("threads", &self.processors.len())
            .field("active", &active)
            .field("blocked", &blocked)
            .field("errorless", &self.is_errorless())
            .finish()
    }
}

/// 处理器统计信息
#[derive(Debug, Clone)]
pub struct ProcessorStats {
    pub id: usize,
    pub status: ProcessorStatus,
    pub queue_len: usize,
    pub used: usize,
    pub schedule_count: u64,
}

/// 调度统计信息
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    pub active: usize,
    pub blocked: usize,
    pub processors: Vec<ProcessorStats>,
    pub results: usize,
    pub referenced: usize,
    pub elapsed: Duration,
}
