//! 结果表
//!
//! 按结果 ID 保存协程的返回值。每个槽位只写入一次：
//! 要么发布返回值，要么标记失败

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::local;
use super::value::Value;
use crate::error::{Result, Rid, RuntimeError};

/// 结果槽位
#[derive(Debug, Default)]
pub struct ResultSlot {
    value: OnceLock<Value>,
    failed: AtomicBool,
}

impl ResultSlot {
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.value.get().is_some()
    }

    #[inline]
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    #[inline]
    pub fn get(&self) -> Option<&Value> {
        self.value.get()
    }
}

/// 结果表
#[derive(Debug, Default)]
pub struct ResultTable {
    slots: DashMap<Rid, Arc<ResultSlot>>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为即将创建的协程预留槽位
    pub fn reserve(&self, rid: Rid) {
        self.slots.entry(rid).or_default();
    }

    fn slot(&self, rid: Rid) -> Arc<ResultSlot> {
        Arc::clone(self.slots.entry(rid).or_default().value())
    }

    /// 发布返回值，已经写入过时返回 false
    pub fn publish(&self, rid: Rid, value: Value) -> bool {
        let slot = self.slot(rid);
        if slot.is_failed() {
            return false;
        }
        slot.value.set(value).is_ok()
    }

    /// 标记为失败（协程以 panic 结束）
    pub fn fail(&self, rid: Rid) {
        let slot = self.slot(rid);
        if !slot.is_ready() {
            slot.failed.store(true, Ordering::Release);
        }
    }

    pub fn is_ready(&self, rid: Rid) -> bool {
        self.slots.get(&rid).map(|s| s.is_ready()).unwrap_or(false)
    }

    pub fn is_failed(&self, rid: Rid) -> bool {
        self.slots.get(&rid).map(|s| s.is_failed()).unwrap_or(false)
    }

    /// 读取已发布的返回值
    pub fn get(&self, rid: Rid) -> Option<Value> {
        self.slots.get(&rid).and_then(|s| s.get().cloned())
    }

    /// 取出槽位并释放
    pub fn remove(&self, rid: Rid) -> Option<Value> {
        self.slots
            .remove(&rid)
            .and_then(|(_, slot)| slot.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&self) {
        self.slots.clear();
    }
}

/// 读取已就绪的结果，结果尚未就绪时返回 None
pub fn try_result_for(rid: Rid) -> Option<Value> {
    local::current_scheduler().and_then(|s| s.results().get(rid))
}

/// 读取已就绪的结果
///
/// 结果尚未就绪是调用方的逻辑错误，会 panic
pub fn result_for(rid: Rid) -> Value {
    match try_result_for(rid) {
        Some(value) => value,
        None => panic!("logic error: {}", RuntimeError::ResultNotReady(rid)),
    }
}

/// 让出执行权直到结果就绪
///
/// 产生结果的协程以 panic 结束时返回错误
pub fn await_result(rid: Rid) -> Result<Value> {
    let sched = local::current_scheduler().ok_or(RuntimeError::OutsideRuntime("await_result"))?;
    loop {
        if let Some(value) = sched.results().get(rid) {
            return Ok(value);
        }
        if sched.results().is_failed(rid) {
            return Err(RuntimeError::Panicked {
                cid: 0,
                message: format!("result {} will never be ready", rid),
            });
        }
        local::yielding();
    }
}
