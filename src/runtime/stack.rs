//! 协程栈管理
//!
//! 栈内存由 corosensei 的 `DefaultStack` 分配（带保护页），
//! 在溢出端写入魔数，用于在协程边界检测栈溢出

use std::cell::Cell;
use std::ptr;

use corosensei::stack::{DefaultStack, Stack};

use crate::config::{MIN_STACK_SIZE, STACK_ALIGN, STACK_CANARY};
use crate::error::{Result, RuntimeError};

/// 魔数占用的字节数（位于栈的最低地址）
const CANARY_RESERVE: usize = 16;

thread_local! {
    /// 当前线程上正在运行的协程的栈边界
    static CURRENT_BOUNDS: Cell<Option<StackBounds>> = const { Cell::new(None) };
}

/// 协程栈边界
///
/// 栈从高地址 `base` 向低地址 `limit` 增长
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// 栈顶（高地址）
    pub base: usize,
    /// 栈底（低地址，魔数所在位置）
    pub limit: usize,
}

impl StackBounds {
    /// 栈的可用大小
    #[inline]
    pub fn size(&self) -> usize {
        self.base - self.limit
    }

    /// 地址是否位于该栈内
    #[inline]
    pub fn contains(&self, sp: usize) -> bool {
        sp > self.limit && sp <= self.base
    }

    /// 给定栈指针处的剩余空间
    #[inline]
    pub fn headroom(&self, sp: usize) -> usize {
        sp.saturating_sub(self.limit + CANARY_RESERVE)
    }

    /// 魔数是否完好
    ///
    /// 只能在栈内存仍然存活时调用
    pub fn canary_intact(&self) -> bool {
        // SAFETY: limit 指向栈内存的最低处，分配时已写入魔数，
        // 调用方保证栈内存仍然存活
        unsafe { ptr::read_volatile(self.limit as *const u64) == STACK_CANARY }
    }
}

/// 将请求的栈大小规整为合法值：不小于 16KB 且 16 字节对齐
pub fn round_size(size: usize) -> usize {
    let size = size.max(MIN_STACK_SIZE);
    (size + STACK_ALIGN - 1) & !(STACK_ALIGN - 1)
}

/// 分配协程栈并写入魔数
pub fn allocate(size: usize) -> Result<(DefaultStack, StackBounds)> {
    let size = round_size(size);
    let stack = DefaultStack::new(size).map_err(RuntimeError::StackAlloc)?;
    // limit() 指向保护页，可用区域从 base - size 开始
    let base = stack.base().get();
    let bounds = StackBounds {
        base,
        limit: base - size,
    };
    debug_assert!(bounds.limit >= stack.limit().get());

    // SAFETY: base - size 位于保护页之上，是刚分配的可写栈内存，16 字节对齐
    unsafe {
        ptr::write_volatile(bounds.limit as *mut u64, STACK_CANARY);
    }

    Ok((stack, bounds))
}

/// 近似获取当前栈指针
#[inline(never)]
pub fn current_sp() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// 设置当前线程正在运行的协程栈
pub(crate) fn enter(bounds: StackBounds) {
    CURRENT_BOUNDS.with(|c| c.set(Some(bounds)));
}

/// 清除当前线程正在运行的协程栈
pub(crate) fn leave() {
    CURRENT_BOUNDS.with(|c| c.set(None));
}

/// 当前协程的栈边界（不在协程中时返回 None）
pub fn current_bounds() -> Option<StackBounds> {
    CURRENT_BOUNDS.with(|c| c.get())
}

/// 当前协程的剩余栈空间
pub fn headroom() -> Option<usize> {
    let bounds = current_bounds()?;
    let sp = current_sp();
    bounds.contains(sp).then(|| bounds.headroom(sp))
}

/// 检查当前协程的栈空间
///
/// 剩余空间小于 `margin` 或魔数被破坏时以 "stack overflow" panic，
/// 由协程入口捕获并标记为 Erred。不在协程中时什么也不做
pub fn stack_check(margin: usize) {
    let Some(bounds) = current_bounds() else {
        return;
    };
    let sp = current_sp();
    if !bounds.contains(sp) {
        return;
    }
    let left = bounds.headroom(sp);
    if left < margin || !bounds.canary_intact() {
        panic!("stack overflow: {} bytes left, {} required", left, margin);
    }
}
