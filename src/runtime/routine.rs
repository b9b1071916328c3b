//! 协程 (Routine) 结构
//!
//! 协程是调度的基本单位。`Routine` 只保存可跨线程共享的元数据，
//! 真正的执行体（栈和上下文）保存在所属线程的 `LocalScheduler` 中

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::value::Value;
use super::waitgroup::WaitGroup;
use crate::error::{Cid, Rid};

/// 协程共享句柄
pub type Co = Arc<Routine>;

/// 协程入口函数
pub type Entry = Box<dyn FnOnce() -> Value + Send + 'static>;

/// 延迟清理函数
pub type Deferred = Box<dyn FnOnce() + Send + 'static>;

/// 协程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RoutineStatus {
    /// 正常返回
    Dead = 0,
    /// 让出后可运行
    Normal = 1,
    /// 正在运行
    Running = 2,
    /// 已创建，尚未运行
    Suspended = 3,
    /// 阻塞在事件上（Channel、WaitGroup、定时器）
    Event = 4,
    /// 以未恢复的 panic 结束
    Erred = 5,
}

impl From<u8> for RoutineStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => RoutineStatus::Dead,
            1 => RoutineStatus::Normal,
            2 => RoutineStatus::Running,
            3 => RoutineStatus::Suspended,
            4 => RoutineStatus::Event,
            _ => RoutineStatus::Erred,
        }
    }
}

impl RoutineStatus {
    /// 是否为终止状态
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, RoutineStatus::Dead | RoutineStatus::Erred)
    }
}

/// 协程运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// `go()` 创建的普通协程
    Normal,
    /// 运行用户主函数的根协程
    Main,
    /// 系统协程（定时器驱动），不计入存活统计
    System,
    /// `launch()` 创建的异步协程
    Async,
}

impl RunMode {
    /// 该模式的协程是否产生结果
    #[inline]
    pub fn has_result(self) -> bool {
        matches!(self, RunMode::Normal | RunMode::Main | RunMode::Async)
    }

    /// 是否计入存活协程统计
    #[inline]
    pub fn is_counted(self) -> bool {
        !matches!(self, RunMode::System)
    }

    /// 是否允许被其他线程窃取
    #[inline]
    pub fn is_stealable(self) -> bool {
        matches!(self, RunMode::Normal | RunMode::Async)
    }
}

/// 协程
pub struct Routine {
    /// 协程唯一 ID
    pub cid: Cid,
    /// 结果 ID（不产生结果的模式为 None）
    pub rid: Option<Rid>,
    /// 运行模式
    pub mode: RunMode,
    /// 栈大小
    pub stack_size: usize,
    /// 协程状态（原子操作）
    status: AtomicU8,
    /// 所属线程
    tid: AtomicUsize,
    /// 是否已开始运行（开始后固定在所属线程上）
    started: AtomicBool,
    /// 是否已退出
    halt: AtomicBool,
    /// 是否以错误结束
    flagged: AtomicBool,
    /// 结果是否已写入结果表
    ready: AtomicBool,
    /// 是否曾被其他线程窃取
    taken: AtomicBool,
    /// 是否被外部引用
    referenced: AtomicBool,
    /// 调度次数
    cycles: AtomicU64,
    /// 入口函数（首次运行时取出）
    entry: Mutex<Option<Entry>>,
    /// 延迟清理函数（后进先出）
    defers: Mutex<Vec<Deferred>>,
    /// 所属的 WaitGroup
    group: Mutex<Option<Arc<WaitGroup>>>,
    /// 本协程当前打开的 WaitGroup
    open_group: Mutex<Option<Arc<WaitGroup>>>,
    /// 调试名称
    name: Mutex<String>,
    /// 调试状态描述
    state: Mutex<String>,
    /// panic 消息
    error: Mutex<Option<String>>,
}

impl Routine {
    /// 创建新的协程记录
    pub fn new(cid: Cid, rid: Option<Rid>, mode: RunMode, tid: usize, stack_size: usize, entry: Option<Entry>) -> Self {
        Self {
            cid,
            rid,
            mode,
            stack_size,
            status: AtomicU8::new(RoutineStatus::Suspended as u8),
            tid: AtomicUsize::new(tid),
            started: AtomicBool::new(false),
            halt: AtomicBool::new(false),
            flagged: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            taken: AtomicBool::new(false),
            referenced: AtomicBool::new(false),
            cycles: AtomicU64::new(0),
            entry: Mutex::new(entry),
            defers: Mutex::new(Vec::new()),
            group: Mutex::new(None),
            open_group: Mutex::new(None),
            name: Mutex::new(format!("co-{}", cid)),
            state: Mutex::new(String::new()),
            error: Mutex::new(None),
        }
    }

    /// 获取协程状态
    #[inline]
    pub fn status(&self) -> RoutineStatus {
        RoutineStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置协程状态
    #[inline]
    pub fn set_status(&self, status: RoutineStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// 尝试将状态从 expected 改为 new
    #[inline]
    pub fn cas_status(&self, expected: RoutineStatus, new: RoutineStatus) -> bool {
        self.status
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        self.status().is_terminal()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.status() == RoutineStatus::Running
    }

    /// 所属线程
    #[inline]
    pub fn tid(&self) -> usize {
        self.tid.load(Ordering::Acquire)
    }

    /// 迁移到其他线程（仅限尚未开始运行的协程）
    pub fn migrate(&self, tid: usize) -> bool {
        if self.is_started() {
            return false;
        }
        self.tid.store(tid, Ordering::Release);
        self.taken.store(true, Ordering::Release);
        true
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// 取出入口函数并标记为已开始，同时固定到当前线程
    pub(crate) fn start(&self, tid: usize) -> Option<Entry> {
        self.tid.store(tid, Ordering::Release);
        self.started.store(true, Ordering::Release);
        self.entry.lock().take()
    }

    /// 是否可以被其他线程窃取
    #[inline]
    pub fn is_stealable(&self) -> bool {
        self.mode.is_stealable() && !self.is_started()
    }

    #[inline]
    pub fn was_taken(&self) -> bool {
        self.taken.load(Ordering::Acquire)
    }

    /// 标记为已退出
    pub(crate) fn halt(&self, erred: bool) {
        if erred {
            self.flagged.store(true, Ordering::Release);
            self.set_status(RoutineStatus::Erred);
        } else {
            self.set_status(RoutineStatus::Dead);
        }
        self.halt.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_flagged(&self) -> bool {
        self.flagged.load(Ordering::Acquire)
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    /// 结果是否已就绪
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// 保持协程记录存活以便外部检查
    pub fn coro_ref(&self) {
        self.referenced.store(true, Ordering::Release);
    }

    /// 解除外部引用
    pub fn coro_unref(&self) {
        self.referenced.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_referenced(&self) -> bool {
        self.referenced.load(Ordering::Acquire)
    }

    /// 增加调度计数
    #[inline]
    pub fn inc_cycles(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    /// 注册延迟清理函数
    pub fn push_defer(&self, f: Deferred) {
        self.defers.lock().push(f);
    }

    /// 取出全部延迟清理函数（按执行顺序）
    pub(crate) fn take_defers(&self) -> Vec<Deferred> {
        let mut defers = std::mem::take(&mut *self.defers.lock());
        defers.reverse();
        defers
    }

    pub fn group(&self) -> Option<Arc<WaitGroup>> {
        self.group.lock().clone()
    }

    pub(crate) fn set_group(&self, group: Arc<WaitGroup>) {
        *self.group.lock() = Some(group);
    }

    pub(crate) fn open_group(&self) -> Option<Arc<WaitGroup>> {
        self.open_group.lock().clone()
    }

    pub(crate) fn replace_open_group(&self, group: Option<Arc<WaitGroup>>) -> Option<Arc<WaitGroup>> {
        std::mem::replace(&mut *self.open_group.lock(), group)
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = name.into();
    }

    pub fn state(&self) -> String {
        self.state.lock().clone()
    }

    pub fn set_state(&self, state: impl Into<String>) {
        *self.state.lock() = state.into();
    }

    pub fn error(&self) -> Option<String> {
        self.error.lock().clone()
    }

    pub(crate) fn set_error(&self, message: String) {
        *self.error.lock() = Some(message);
    }
}

impl std::fmt::Debug for Routine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routine")
            .field("cid", &self.cid)
            .field("rid", &self.rid)
            .field("mode", &self.mode)
            .field("status", &self.status())
            .field("tid", &self.tid())
            .finish()
    }
}
