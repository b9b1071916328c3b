//! Chase-Lev 工作窃取双端队列
//!
//! - 拥有者线程在 `bottom` 端 push/take
//! - 其他线程在 `top` 端通过 CAS steal
//!
//! 缓冲区只增长不收缩。扩容后的旧缓冲区可能仍被正在进行的 steal 读取，
//! 因此交给 crossbeam 的 epoch 回收，等所有窃取者离开临界区后再释放

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::{self, MaybeUninit};
use std::sync::atomic::{self, AtomicIsize, Ordering};
use std::sync::Arc;

use crossbeam::epoch::{self, Atomic, Owned};
use crossbeam_utils::CachePadded;

/// 最小容量（必须是 2 的幂）
const MIN_CAPACITY: usize = 16;

/// take/steal 的结果
#[derive(Debug, PartialEq, Eq)]
pub enum Steal<T> {
    /// 队列为空
    Empty,
    /// 与其他线程竞争失败，可以重试
    Aborted,
    /// 成功取得元素
    Success(T),
}

impl<T> Steal<T> {
    /// 转换为 Option，Empty 和 Aborted 都返回 None
    pub fn success(self) -> Option<T> {
        match self {
            Steal::Success(v) => Some(v),
            _ => None,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, Steal::Empty)
    }

    #[inline]
    pub fn is_aborted(&self) -> bool {
        matches!(self, Steal::Aborted)
    }
}

/// 环形缓冲区
///
/// 只负责内存，不负责其中元素的析构
struct Buffer<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

impl<T> Buffer<T> {
    fn alloc(cap: usize) -> Self {
        debug_assert!(cap.is_power_of_two());
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots }
    }

    #[inline]
    fn cap(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn slot(&self, index: isize) -> *mut MaybeUninit<T> {
        self.slots[(index as usize) & (self.cap() - 1)].get()
    }

    /// 按位写入
    #[inline]
    unsafe fn write(&self, index: isize, value: T) {
        (*self.slot(index)).write(value);
    }

    /// 按位读出（不转移所有权语义，调用方负责避免重复析构）
    #[inline]
    unsafe fn read(&self, index: isize) -> T {
        (*self.slot(index)).assume_init_read()
    }
}

struct Inner<T> {
    /// 窃取端索引
    top: CachePadded<AtomicIsize>,
    /// 拥有者端索引
    bottom: CachePadded<AtomicIsize>,
    /// 当前缓冲区
    buffer: CachePadded<Atomic<Buffer<T>>>,
}

// SAFETY: 元素通过原子索引协议在线程间转移所有权
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    #[inline]
    fn len(&self) -> usize {
        let b = self.bottom.load(Ordering::Relaxed);
        let t = self.top.load(Ordering::Relaxed);
        b.wrapping_sub(t).max(0) as usize
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let t = *self.top.get_mut();
        let b = *self.bottom.get_mut();
        // SAFETY: 独占访问，没有其他线程能看到该队列
        unsafe {
            let guard = epoch::unprotected();
            let buffer = self.buffer.load(Ordering::Relaxed, guard);
            let mut i = t;
            while i != b {
                drop(buffer.deref().read(i));
                i = i.wrapping_add(1);
            }
            drop(buffer.into_owned());
        }
    }
}

/// 拥有者端
///
/// 只能由一个线程持有（不是 Sync），可以移动到其他线程
pub struct Owner<T> {
    inner: Arc<Inner<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

/// 窃取端，可在任意线程间共享
pub struct Stealer<T> {
    inner: Arc<Inner<T>>,
}

/// 创建工作窃取队列
pub fn new<T: Send>(capacity: usize) -> (Owner<T>, Stealer<T>) {
    let cap = capacity.max(MIN_CAPACITY).next_power_of_two();
    let inner = Arc::new(Inner {
        top: CachePadded::new(AtomicIsize::new(0)),
        bottom: CachePadded::new(AtomicIsize::new(0)),
        buffer: CachePadded::new(Atomic::new(Buffer::alloc(cap))),
    });
    (
        Owner {
            inner: Arc::clone(&inner),
            _not_sync: PhantomData,
        },
        Stealer { inner },
    )
}

impl<T: Send> Owner<T> {
    /// 当前元素数量（近似值）
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 当前缓冲区容量
    pub fn capacity(&self) -> usize {
        let guard = epoch::pin();
        let buffer = self.inner.buffer.load(Ordering::Relaxed, &guard);
        // SAFETY: 缓冲区只由拥有者替换，当前线程就是拥有者
        unsafe { buffer.deref().cap() }
    }

    /// 在 bottom 端压入元素，满时扩容为两倍
    pub fn push(&self, value: T) {
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let t = self.inner.top.load(Ordering::Acquire);
        let guard = epoch::pin();
        let mut buffer = self.inner.buffer.load(Ordering::Relaxed, &guard);

        // SAFETY: 只有拥有者替换缓冲区，读取到的缓冲区在 guard 期间有效
        unsafe {
            if b.wrapping_sub(t) >= buffer.deref().cap() as isize {
                self.grow(t, b, &guard);
                buffer = self.inner.buffer.load(Ordering::Relaxed, &guard);
            }
            buffer.deref().write(b, value);
        }

        atomic::fence(Ordering::Release);
        self.inner.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
    }

    /// 扩容：复制 [top, bottom) 到两倍大小的新缓冲区
    unsafe fn grow(&self, t: isize, b: isize, guard: &epoch::Guard) {
        let old = self.inner.buffer.load(Ordering::Relaxed, guard);
        let old_ref = old.deref();
        let new = Buffer::alloc(old_ref.cap() * 2);

        let mut i = t;
        while i != b {
            std::ptr::copy_nonoverlapping(old_ref.slot(i), new.slot(i), 1);
            i = i.wrapping_add(1);
        }

        let old = self.inner.buffer.swap(Owned::new(new), Ordering::Release, guard);
        // 旧缓冲区中的元素已按位移动到新缓冲区，只释放内存
        guard.defer_destroy(old);
        guard.flush();
    }

    /// 在 bottom 端取出元素
    ///
    /// 只剩一个元素时与窃取者竞争 top，失败返回 Aborted
    pub fn take(&self) -> Steal<T> {
        let b = self.inner.bottom.load(Ordering::Relaxed).wrapping_sub(1);
        self.inner.bottom.store(b, Ordering::Relaxed);
        atomic::fence(Ordering::SeqCst);
        let t = self.inner.top.load(Ordering::Relaxed);

        let len = b.wrapping_sub(t);
        if len < 0 {
            self.inner.bottom.store(b.wrapping_add(1), Ordering::Relaxed);
            return Steal::Empty;
        }

        let guard = epoch::pin();
        let buffer = self.inner.buffer.load(Ordering::Relaxed, &guard);
        // SAFETY: [t, b] 区间内的槽位已初始化
        let value = unsafe { buffer.deref().read(b) };

        if len > 0 {
            return Steal::Success(value);
        }

        // 最后一个元素，和窃取者竞争
        let won = self
            .inner
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_ok();
        self.inner.bottom.store(b.wrapping_add(1), Ordering::Relaxed);

        if won {
            Steal::Success(value)
        } else {
            // 元素已被窃取者拿走
            mem::forget(value);
            Steal::Aborted
        }
    }

    /// 获取窃取端
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Copy> Owner<T> {
    /// 调试读取：从 top 起第 index 个元素，不转移所有权，结果不保证是最新的
    pub fn peek(&self, index: usize) -> Option<T> {
        let t = self.inner.top.load(Ordering::Acquire);
        let b = self.inner.bottom.load(Ordering::Relaxed);
        let i = t.wrapping_add(index as isize);
        if i.wrapping_sub(b) >= 0 {
            return None;
        }
        let guard = epoch::pin();
        let buffer = self.inner.buffer.load(Ordering::Relaxed, &guard);
        // SAFETY: T 是 Copy，按位读取不会造成重复析构
        Some(unsafe { buffer.deref().read(i) })
    }
}

impl<T: Send> Stealer<T> {
    /// 在 top 端窃取元素
    pub fn steal(&self) -> Steal<T> {
        let t = self.inner.top.load(Ordering::Acquire);
        atomic::fence(Ordering::SeqCst);
        let b = self.inner.bottom.load(Ordering::Acquire);

        if b.wrapping_sub(t) <= 0 {
            return Steal::Empty;
        }

        let guard = epoch::pin();
        let buffer = self.inner.buffer.load(Ordering::Acquire, &guard);
        // SAFETY: 缓冲区受 epoch 保护；若 CAS 失败则放弃读到的副本
        let value = unsafe { buffer.deref().read(t) };

        if self
            .inner
            .top
            .compare_exchange(t, t.wrapping_add(1), Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            mem::forget(value);
            return Steal::Aborted;
        }

        Steal::Success(value)
    }

    /// 当前元素数量（近似值）
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> std::fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stealer").field("len", &self.inner.len()).finish()
    }
}
