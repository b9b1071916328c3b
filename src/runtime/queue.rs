//! 本地运行队列与睡眠队列
//!
//! 两者都只由所属线程访问，不需要同步

use std::collections::{BTreeMap, VecDeque};
use std::time::Instant;

use super::routine::Co;

/// 本地运行队列（FIFO）
#[derive(Default)]
pub struct RunQueue {
    queue: VecDeque<Co>,
}

impl RunQueue {
    /// 创建新的运行队列
    pub fn new() -> Self {
        Self {
            queue: VecDeque::with_capacity(64),
        }
    }

    /// 获取队列长度
    #[inline]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// 检查队列是否为空
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// 加入队尾
    #[inline]
    pub fn push(&mut self, co: Co) {
        self.queue.push_back(co);
    }

    /// 取出队头
    #[inline]
    pub fn pop(&mut self) -> Option<Co> {
        self.queue.pop_front()
    }

    /// 取出全部协程
    pub fn drain(&mut self) -> Vec<Co> {
        self.queue.drain(..).collect()
    }
}

/// 睡眠队列
///
/// 按 (唤醒时间, 插入序号) 排序，唤醒时间相同的按插入顺序唤醒
#[derive(Default)]
pub struct SleepQueue {
    sleepers: BTreeMap<(Instant, u64), Co>,
    seq: u64,
}

impl SleepQueue {
    /// 创建新的睡眠队列
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sleepers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sleepers.is_empty()
    }

    /// 插入睡眠协程
    pub fn insert(&mut self, deadline: Instant, co: Co) {
        self.seq += 1;
        self.sleepers.insert((deadline, self.seq), co);
    }

    /// 最早的唤醒时间
    pub fn next_deadline(&self) -> Option<Instant> {
        self.sleepers.keys().next().map(|(deadline, _)| *deadline)
    }

    /// 取出所有唤醒时间不晚于 now 的协程（按唤醒时间排序）
    pub fn pop_expired(&mut self, now: Instant) -> Vec<Co> {
        let mut expired = Vec::new();
        while let Some(entry) = self.sleepers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            expired.push(entry.remove());
        }
        expired
    }

    /// 取出全部协程
    pub fn drain(&mut self) -> Vec<Co> {
        std::mem::take(&mut self.sleepers).into_values().collect()
    }
}
