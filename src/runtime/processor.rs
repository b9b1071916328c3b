//! 逻辑处理器 (Processor)
//!
//! 每个调度线程对应一个 Processor，保存其他线程需要访问的那部分状态：
//! 可窃取队列的 Stealer、跨线程唤醒的收件箱，以及休眠/唤醒同步

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_deque::{Injector, Steal as InboxSteal};
use parking_lot::{Condvar, Mutex};

use super::deque::{self, Owner, Stealer};
use super::routine::Co;

/// 处理器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorStatus {
    /// 空闲（休眠中）
    Idle = 0,
    /// 正在窃取
    Stealing = 1,
    /// 运行中
    Running = 2,
    /// 正在退出
    Draining = 3,
    /// 已退出
    Exited = 4,
}

impl From<u8> for ProcessorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => ProcessorStatus::Idle,
            1 => ProcessorStatus::Stealing,
            2 => ProcessorStatus::Running,
            3 => ProcessorStatus::Draining,
            _ => ProcessorStatus::Exited,
        }
    }
}

/// 逻辑处理器
pub struct Processor {
    /// 处理器 ID（即线程序号，0 为主线程）
    pub id: usize,
    /// 处理器状态
    status: AtomicU8,
    /// 本线程可窃取队列的窃取端
    stealer: Stealer<Co>,
    /// 其他线程唤醒的、属于本线程的协程
    inbox: Injector<Co>,
    /// 休眠/唤醒同步
    park_mutex: Mutex<bool>,
    park_cond: Condvar,
    /// 调度计数
    schedule_count: AtomicU64,
    /// 本线程上已开始、尚未结束的协程数
    used: AtomicUsize,
    /// 调度循环是否已在本线程上启动
    started: AtomicBool,
}

impl Processor {
    /// 创建新的处理器，返回可窃取队列的所有者端
    pub fn new(id: usize, queue_size: usize) -> (Self, Owner<Co>) {
        let (owner, stealer) = deque::new(queue_size);
        let processor = Self {
            id,
            status: AtomicU8::new(ProcessorStatus::Idle as u8),
            stealer,
            inbox: Injector::new(),
            park_mutex: Mutex::new(false),
            park_cond: Condvar::new(),
            schedule_count: AtomicU64::new(0),
            used: AtomicUsize::new(0),
            started: AtomicBool::new(false),
        };
        (processor, owner)
    }

    /// 获取处理器状态
    #[inline]
    pub fn status(&self) -> ProcessorStatus {
        ProcessorStatus::from(self.status.load(Ordering::Acquire))
    }

    /// 设置处理器状态
    #[inline]
    pub fn set_status(&self, status: ProcessorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_idle(&self) -> bool {
        self.status() == ProcessorStatus::Idle
    }

    /// 可窃取队列的窃取端
    #[inline]
    pub fn stealer(&self) -> &Stealer<Co> {
        &self.stealer
    }

    /// 可窃取队列中的协程数
    #[inline]
    pub fn queue_len(&self) -> usize {
        self.stealer.len()
    }

    /// 投递一个属于本线程的协程，并唤醒本线程
    pub fn deliver(&self, co: Co) {
        self.inbox.push(co);
        self.unpark();
    }

    /// 取出收件箱中的全部协程
    pub fn drain_inbox(&self) -> Vec<Co> {
        let mut woken = Vec::new();
        loop {
            match self.inbox.steal() {
                InboxSteal::Success(co) => woken.push(co),
                InboxSteal::Retry => continue,
                InboxSteal::Empty => break,
            }
        }
        woken
    }

    #[inline]
    pub fn inbox_is_empty(&self) -> bool {
        self.inbox.is_empty()
    }

    /// 休眠，直到被唤醒或超时
    ///
    /// 唤醒令牌保证 unpark 先于 park 发生时不会丢失
    pub fn park_timeout(&self, timeout: Duration) {
        let mut notified = self.park_mutex.lock();
        if !*notified {
            let prev = self.status();
            self.set_status(ProcessorStatus::Idle);
            self.park_cond.wait_for(&mut notified, timeout);
            self.set_status(prev);
        }
        *notified = false;
    }

    /// 休眠到指定时刻
    pub fn park_until(&self, deadline: Instant) {
        let now = Instant::now();
        if deadline > now {
            self.park_timeout(deadline - now);
        }
    }

    /// 唤醒线程
    pub fn unpark(&self) {
        let mut notified = self.park_mutex.lock();
        *notified = true;
        self.park_cond.notify_one();
    }

    /// 增加调度计数
    #[inline]
    pub fn inc_schedule_count(&self) {
        self.schedule_count.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取调度计数
    #[inline]
    pub fn schedule_count(&self) -> u64 {
        self.schedule_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn inc_used(&self) {
        self.used.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn dec_used(&self) {
        self.used.fetch_sub(1, Ordering::Relaxed);
    }

    /// 本线程上已开始、尚未结束的协程数
    #[inline]
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Processor")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("queue_len", &self.queue_len())
            .field("schedule_count", &self.schedule_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::routine::{RunMode, Routine};
    use crate::runtime::value::Value;
    use std::sync::Arc;
    use std::thread;

    fn make_test_routine(cid: u64) -> Co {
        Arc::new(Routine::new(cid, None, RunMode::Normal, 0, 64 * 1024, Some(Box::new(|| Value::Null))))
    }

    #[test]
    fn test_processor_new() {
        let (p, owner) = Processor::new(0, 16);
        assert_eq!(p.id, 0);
        assert!(p.is_idle());
        assert_eq!(p.queue_len(), 0);
        assert_eq!(owner.capacity(), 16);
        assert!(!p.is_started());
    }

    #[test]
    fn test_processor_status() {
        let (p, _owner) = Processor::new(1, 16);
        p.set_status(ProcessorStatus::Running);
        assert_eq!(p.status(), ProcessorStatus::Running);
        assert!(!p.is_idle());
    }

    #[test]
    fn test_inbox_keeps_order() {
        let (p, _owner) = Processor::new(0, 16);
        p.deliver(make_test_routine(1));
        p.deliver(make_test_routine(2));
        assert!(!p.inbox_is_empty());

        let cids: Vec<_> = p.drain_inbox().iter().map(|co| co.cid).collect();
        assert_eq!(cids, vec![1, 2]);
        assert!(p.inbox_is_empty());
    }

    #[test]
    fn test_stealer_sees_owner_pushes() {
        let (p, owner) = Processor::new(0, 16);
        owner.push(make_test_routine(7));
        assert_eq!(p.queue_len(), 1);
        assert_eq!(p.stealer().steal().success().map(|co| co.cid), Some(7));
    }

    #[test]
    fn test_unpark_before_park_is_not_lost() {
        let (p, _owner) = Processor::new(0, 16);
        p.unpark();
        let start = Instant::now();
        p.park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_unpark_from_other_thread() {
        let (p, _owner) = Processor::new(0, 16);
        let p = Arc::new(p);
        let remote = Arc::clone(&p);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.unpark();
        });
        let start = Instant::now();
        p.park_timeout(Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(4));
        handle.join().unwrap();
    }
}
