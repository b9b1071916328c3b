//! Channel 实现
//!
//! Go 风格的 Channel：无缓冲时收发双方直接交接，带缓冲时按 FIFO 排队。
//! 所有操作（send / recv / select）都走同一个交汇过程：
//! 按 ID 顺序锁住涉及的 Channel，找出可以立即完成的分支并随机选一个；
//! 都不能完成时在每个 Channel 上登记等待记录并挂起，
//! 对方通过原子认领保证一次 select 只有一个分支被完成

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, Thread};

use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;

use super::local;
use super::routine::Co;
use super::scheduler::Scheduler;
use super::stack;
use super::value::Value;
use crate::config::STACK_CHECK_MARGIN;
use crate::error::{Result, RuntimeError};

/// Channel ID 计数器
static CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// 阻塞在 Channel 上的非协程线程数
static EXTERNAL_WAITERS: AtomicUsize = AtomicUsize::new(0);

/// 完成的交汇次数
static TRANSFERS: AtomicU64 = AtomicU64::new(0);

/// 尚未触发
const PENDING: usize = usize::MAX;
/// 因 Channel 被释放而触发
const FREED: usize = usize::MAX - 1;

/// 进程级 Channel 表，释放时从表中移除
fn registry() -> &'static DashMap<u64, Weak<Channel>> {
    static REGISTRY: OnceLock<DashMap<u64, Weak<Channel>>> = OnceLock::new();
    REGISTRY.get_or_init(DashMap::new)
}

/// 当前存活的 Channel 数量
pub fn live_channels() -> usize {
    registry().len()
}

/// 阻塞在 Channel 上的非协程线程数
///
/// 这些线程可能唤醒协程，存在时不做死锁判定
pub(crate) fn external_waiters() -> usize {
    EXTERNAL_WAITERS.load(Ordering::SeqCst)
}

/// 进程内完成的交汇次数，只增不减
///
/// 调度器用它判断两次空闲检查之间是否有进展
pub(crate) fn transfers() -> u64 {
    TRANSFERS.load(Ordering::SeqCst)
}

/// 挂起的一方
enum Parked {
    Coroutine(Arc<Scheduler>, Co),
    Thread(Thread),
}

/// 一次阻塞交汇的共享状态，同一次 select 的所有等待记录共用
struct AltSync {
    /// 被完成的分支下标，PENDING 表示尚未触发
    fired: AtomicUsize,
    /// 交接完成
    done: AtomicBool,
    /// 导致触发的被释放 Channel
    freed: AtomicU64,
    /// 接收到的值
    received: Mutex<Option<Value>>,
    parked: Parked,
}

impl AltSync {
    fn new(parked: Parked) -> Self {
        Self {
            fired: AtomicUsize::new(PENDING),
            done: AtomicBool::new(false),
            freed: AtomicU64::new(0),
            received: Mutex::new(None),
            parked,
        }
    }

    /// 认领第 index 个分支，每个 AltSync 只有一次认领能成功
    #[inline]
    fn claim(&self, index: usize) -> bool {
        self.fired
            .compare_exchange(PENDING, index, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn is_live(&self) -> bool {
        self.fired.load(Ordering::Acquire) == PENDING
    }

    /// 交接完成，唤醒挂起的一方
    fn finish(&self) {
        self.done.store(true, Ordering::Release);
        match &self.parked {
            Parked::Coroutine(sched, co) => sched.wake(Arc::clone(co)),
            Parked::Thread(t) => t.unpark(),
        }
    }
}

/// 登记在 Channel 上的等待记录
struct Waiter {
    sync: Arc<AltSync>,
    index: usize,
    /// 待发送的值（接收等待为 None）
    value: Option<Value>,
}

#[derive(Default)]
struct ChanState {
    buf: VecDeque<Value>,
    senders: VecDeque<Waiter>,
    receivers: VecDeque<Waiter>,
}

impl ChanState {
    /// 丢弃队头已被其他分支触发的等待记录
    fn purge(list: &mut VecDeque<Waiter>) {
        while list.front().map(|w| !w.sync.is_live()).unwrap_or(false) {
            list.pop_front();
        }
    }

    fn remove_sync(&mut self, sync: &Arc<AltSync>) {
        self.senders.retain(|w| !Arc::ptr_eq(&w.sync, sync));
        self.receivers.retain(|w| !Arc::ptr_eq(&w.sync, sync));
    }

    fn holds(&self, sync: &Arc<AltSync>, index: usize) -> bool {
        self.senders
            .iter()
            .chain(self.receivers.iter())
            .any(|w| Arc::ptr_eq(&w.sync, sync) && w.index == index)
    }
}

/// Channel 共享句柄
pub type Chan = Arc<Channel>;

/// Channel
pub struct Channel {
    id: u64,
    name: Option<String>,
    /// 缓冲区容量（0 表示无缓冲）
    capacity: usize,
    state: Mutex<ChanState>,
    /// 有缓冲数据或有等待者
    select_ready: AtomicBool,
    freed: AtomicBool,
}

impl Channel {
    fn create(name: Option<String>, capacity: usize) -> Chan {
        let chan = Arc::new(Self {
            id: CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
            name,
            capacity,
            state: Mutex::new(ChanState {
                buf: VecDeque::with_capacity(capacity),
                ..Default::default()
            }),
            select_ready: AtomicBool::new(false),
            freed: AtomicBool::new(false),
        });
        registry().insert(chan.id, Arc::downgrade(&chan));
        chan
    }

    /// 创建无缓冲 Channel
    pub fn new() -> Chan {
        Self::create(None, 0)
    }

    /// 创建带缓冲 Channel
    pub fn with_capacity(capacity: usize) -> Chan {
        Self::create(None, capacity)
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 缓冲区中的元素数
    pub fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 是否有缓冲数据或等待中的对端（非阻塞轮询用）
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.select_ready.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    fn refresh(&self, state: &ChanState) {
        let ready = !state.buf.is_empty() || !state.senders.is_empty() || !state.receivers.is_empty();
        self.select_ready.store(ready, Ordering::Release);
    }

    /// 发送，必要时阻塞
    pub fn send(&self, value: impl Into<Value>) -> Result<()> {
        let mut ops = [Op::Send(self, Some(value.into()))];
        rendezvous(&mut ops, true).map(|_| ())
    }

    /// 接收，必要时阻塞
    pub fn recv(&self) -> Result<Value> {
        let mut ops = [Op::Recv(self)];
        Ok(rendezvous(&mut ops, true)?
            .and_then(|s| s.value)
            .unwrap_or_default())
    }

    /// 尝试发送，不能立即完成时原样返回值
    pub fn try_send(&self, value: impl Into<Value>) -> std::result::Result<(), Value> {
        let mut ops = [Op::Send(self, Some(value.into()))];
        match rendezvous(&mut ops, false) {
            Ok(Some(_)) => Ok(()),
            _ => Err(ops[0].take_value().unwrap_or_default()),
        }
    }

    /// 尝试接收
    pub fn try_recv(&self) -> Option<Value> {
        let mut ops = [Op::Recv(self)];
        rendezvous(&mut ops, false)
            .ok()
            .flatten()
            .map(|s| s.value.unwrap_or_default())
    }

    /// 释放 Channel
    ///
    /// 唤醒所有等待者（它们的操作返回 `ChannelFreed`），之后的操作都失败。
    /// 重复释放无效
    pub fn free(&self) {
        if self.freed.swap(true, Ordering::AcqRel) {
            return;
        }
        registry().remove(&self.id);

        let waiters: Vec<Waiter> = {
            let mut state = self.state.lock();
            state.buf.clear();
            let mut waiters: Vec<Waiter> = state.senders.drain(..).collect();
            waiters.extend(state.receivers.drain(..));
            self.refresh(&state);
            waiters
        };

        for w in waiters {
            if w.sync
                .fired
                .compare_exchange(PENDING, FREED, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                w.sync.freed.store(self.id, Ordering::Release);
                w.sync.finish();
            }
        }
        tracing::debug!(channel = self.id, "channel freed");
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        registry().remove(&self.id);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("freed", &self.is_freed())
            .finish()
    }
}

/// 交汇中的一个分支
enum Op<'a> {
    Send(&'a Channel, Option<Value>),
    Recv(&'a Channel),
}

impl<'a> Op<'a> {
    #[inline]
    fn channel(&self) -> &'a Channel {
        match self {
            Op::Send(c, _) | Op::Recv(c) => c,
        }
    }

    fn take_value(&mut self) -> Option<Value> {
        match self {
            Op::Send(_, value) => value.take(),
            Op::Recv(_) => None,
        }
    }

    /// 是否可以立即完成（顺带清理队头的失效等待记录）
    fn is_ready(&self, state: &mut ChanState) -> bool {
        match self {
            Op::Send(c, _) => {
                ChanState::purge(&mut state.receivers);
                !state.receivers.is_empty() || state.buf.len() < c.capacity
            }
            Op::Recv(_) => {
                ChanState::purge(&mut state.senders);
                !state.buf.is_empty() || !state.senders.is_empty()
            }
        }
    }

    /// 执行交接，对端在认领前已被其他分支触发时返回 None
    fn transfer(&mut self, state: &mut ChanState) -> Option<Option<Value>> {
        match self {
            Op::Send(c, value) => {
                while let Some(w) = state.receivers.pop_front() {
                    if w.sync.claim(w.index) {
                        *w.sync.received.lock() = value.take();
                        w.sync.finish();
                        return Some(None);
                    }
                }
                if state.buf.len() < c.capacity {
                    state.buf.push_back(value.take().unwrap_or_default());
                    return Some(None);
                }
                None
            }
            Op::Recv(_) => {
                if let Some(v) = state.buf.pop_front() {
                    // 腾出的位置交给等待最久的发送者
                    while let Some(mut w) = state.senders.pop_front() {
                        if w.sync.claim(w.index) {
                            state.buf.push_back(w.value.take().unwrap_or_default());
                            w.sync.finish();
                            break;
                        }
                    }
                    return Some(Some(v));
                }
                while let Some(mut w) = state.senders.pop_front() {
                    if w.sync.claim(w.index) {
                        let v = w.value.take().unwrap_or_default();
                        w.sync.finish();
                        return Some(Some(v));
                    }
                }
                None
            }
        }
    }
}

/// select 的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Selected {
    /// 完成的分支下标
    pub index: usize,
    /// 接收分支收到的值（发送分支为 None）
    pub value: Option<Value>,
}

/// 交汇过程
///
/// `block` 为 false 时没有可立即完成的分支就返回 Ok(None)
fn rendezvous(ops: &mut [Op<'_>], block: bool) -> Result<Option<Selected>> {
    stack::stack_check(STACK_CHECK_MARGIN);

    let mut chans: Vec<&Channel> = ops.iter().map(|op| op.channel()).collect();
    chans.sort_by_key(|c| c.id);
    chans.dedup_by_key(|c| c.id);
    let slot = |c: &Channel| chans.iter().position(|x| x.id == c.id).unwrap_or(0);

    let mut guards: Vec<MutexGuard<'_, ChanState>> = chans.iter().map(|c| c.state.lock()).collect();
    if let Some(c) = chans.iter().find(|c| c.is_freed()) {
        return Err(RuntimeError::ChannelFreed(c.id));
    }

    let mut candidates: Vec<usize> = (0..ops.len())
        .filter(|&i| {
            let s = slot(ops[i].channel());
            ops[i].is_ready(&mut guards[s])
        })
        .collect();

    let mut rng = rand::thread_rng();
    while !candidates.is_empty() {
        let pick = candidates.swap_remove(rng.gen_range(0..candidates.len()));
        let s = slot(ops[pick].channel());
        if let Some(value) = ops[pick].transfer(&mut guards[s]) {
            for (c, g) in chans.iter().zip(&guards) {
                c.refresh(g);
            }
            TRANSFERS.fetch_add(1, Ordering::SeqCst);
            return Ok(Some(Selected { index: pick, value }));
        }
    }

    if !block {
        for (c, g) in chans.iter().zip(&guards) {
            c.refresh(g);
        }
        return Ok(None);
    }

    let parked = match local::current_context() {
        Some((sched, co)) => Parked::Coroutine(sched, co),
        None => Parked::Thread(thread::current()),
    };
    let sync = Arc::new(AltSync::new(parked));
    match &sync.parked {
        Parked::Coroutine(sched, co) => sched.prepare_park(co),
        Parked::Thread(_) => {
            EXTERNAL_WAITERS.fetch_add(1, Ordering::SeqCst);
        }
    }

    for (index, op) in ops.iter_mut().enumerate() {
        let s = slot(op.channel());
        let waiter = Waiter {
            sync: Arc::clone(&sync),
            index,
            value: op.take_value(),
        };
        match op {
            Op::Send(..) => guards[s].senders.push_back(waiter),
            Op::Recv(_) => guards[s].receivers.push_back(waiter),
        }
    }
    for (c, g) in chans.iter().zip(&guards) {
        c.refresh(g);
    }
    drop(guards);

    match &sync.parked {
        Parked::Coroutine(..) => local::park(),
        Parked::Thread(_) => {
            while !sync.done.load(Ordering::Acquire) {
                thread::park();
            }
            EXTERNAL_WAITERS.fetch_sub(1, Ordering::SeqCst);
        }
    }

    let fired = sync.fired.load(Ordering::Acquire);
    for c in &chans {
        let mut state = c.state.lock();
        if fired < ops.len() && ops[fired].channel().id == c.id && state.holds(&sync, fired) {
            panic!(
                "internal consistency: completed alternative {} still queued on channel {}",
                fired, c.id
            );
        }
        state.remove_sync(&sync);
        c.refresh(&state);
    }

    if fired == FREED {
        return Err(RuntimeError::ChannelFreed(sync.freed.load(Ordering::Acquire)));
    }
    let value = match ops.get(fired) {
        Some(Op::Recv(_)) => Some(sync.received.lock().take().unwrap_or_default()),
        _ => None,
    };
    TRANSFERS.fetch_add(1, Ordering::SeqCst);
    Ok(Some(Selected { index: fired, value }))
}

/// 多路选择
///
/// ```ignore
/// let selected = Select::new().recv(&a).send(&b, 1).wait()?;
/// ```
#[derive(Default)]
pub struct Select<'a> {
    ops: Vec<Op<'a>>,
}

impl<'a> Select<'a> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    /// 添加发送分支
    pub fn send(mut self, chan: &'a Channel, value: impl Into<Value>) -> Self {
        self.ops.push(Op::Send(chan, Some(value.into())));
        self
    }

    /// 添加接收分支
    pub fn recv(mut self, chan: &'a Channel) -> Self {
        self.ops.push(Op::Recv(chan));
        self
    }

    /// 阻塞直到某个分支完成
    ///
    /// 没有任何分支时永远阻塞
    pub fn wait(mut self) -> Result<Selected> {
        match rendezvous(&mut self.ops, true)? {
            Some(selected) => Ok(selected),
            None => unreachable!("blocking rendezvous always completes"),
        }
    }

    /// 完成一个可以立即完成的分支，没有时返回 None
    pub fn try_wait(mut self) -> Result<Option<Selected>> {
        rendezvous(&mut self.ops, false)
    }
}

/// 创建无缓冲 Channel
pub fn channel() -> Chan {
    Channel::new()
}

/// 创建带缓冲 Channel
pub fn channel_buf(capacity: usize) -> Chan {
    Channel::with_capacity(capacity)
}

/// 创建带名称的 Channel（用于调试输出）
pub fn channel_named(name: impl Into<String>, capacity: usize) -> Chan {
    Channel::create(Some(name.into()), capacity)
}

/// 发送
pub fn chan_send(chan: &Channel, value: impl Into<Value>) -> Result<()> {
    chan.send(value)
}

/// 接收
pub fn chan_recv(chan: &Channel) -> Result<Value> {
    chan.recv()
}

/// 释放
pub fn chan_free(chan: &Channel) {
    chan.free()
}

/// 轮询式多路选择
///
/// 依次尝试每个分支，第一个能立即完成的分支执行其代码块并跳出循环；
/// 有 `default` 分支时不等待，否则让出执行权后重试。
///
/// ```ignore
/// let got = for_select! {
///     recv(rx) -> v => { Some(v) },
///     send(tx, 1) => { None },
///     default => { None },
/// };
/// ```
#[macro_export]
macro_rules! for_select {
    ($($arms:tt)*) => {
        loop {
            $crate::__for_select_arms!($($arms)*);
            $crate::yielding();
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __for_select_arms {
    () => {};
    (recv($chan:expr) -> $value:pat => $body:block $(, $($rest:tt)*)?) => {
        {
            let __chan = &$chan;
            if $crate::runtime::channel::Channel::is_ready(__chan) {
                if let ::std::option::Option::Some(__received) = $crate::runtime::channel::Channel::try_recv(__chan) {
                    let $value = __received;
                    break $body;
                }
            }
        }
        $crate::__for_select_arms!($($($rest)*)?);
    };
    (send($chan:expr, $send:expr) => $body:block $(, $($rest:tt)*)?) => {
        if $crate::runtime::channel::Channel::try_send(&$chan, $send).is_ok() {
            break $body;
        }
        $crate::__for_select_arms!($($($rest)*)?);
    };
    (default => $body:block $(,)?) => {
        if true {
            break $body;
        }
    };
}

/// 类型化 Channel 包装
pub struct TypedChannel<T> {
    inner: Chan,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Into<Value> + TryFrom<Value>> TypedChannel<T> {
    /// 创建无缓冲 Channel
    pub fn new() -> Self {
        Self {
            inner: Channel::new(),
            _marker: PhantomData,
        }
    }

    /// 创建带缓冲 Channel
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Channel::with_capacity(capacity),
            _marker: PhantomData,
        }
    }

    /// 发送值
    pub fn send(&self, value: T) -> Result<()> {
        self.inner.send(value.into())
    }

    /// 尝试发送
    pub fn try_send(&self, value: T) -> bool {
        self.inner.try_send(value.into()).is_ok()
    }

    /// 接收值，Channel 已释放或类型不符时返回 None
    pub fn recv(&self) -> Option<T> {
        self.inner.recv().ok().and_then(|v| T::try_from(v).ok())
    }

    /// 尝试接收
    pub fn try_recv(&self) -> Option<T> {
        self.inner.try_recv().and_then(|v| T::try_from(v).ok())
    }

    /// 底层 Channel
    pub fn channel(&self) -> &Chan {
        &self.inner
    }
}

impl<T> Clone for TypedChannel<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Into<Value> + TryFrom<Value>> Default for TypedChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_channel_unbuffered_across_threads() {
        let ch = channel();
        let tx = Arc::clone(&ch);
        let sender = thread::spawn(move || {
            for i in 0..5 {
                tx.send(i).unwrap();
            }
        });

        let received: Vec<_> = (0..5).map(|_| ch.recv().unwrap()).collect();
        sender.join().unwrap();
        assert_eq!(received, (0..5).map(Value::from).collect::<Vec<_>>());
        assert_eq!(external_waiters(), 0);
    }

    #[test]
    fn test_unbuffered_try_ops_need_partner() {
        let ch = channel();
        assert_eq!(ch.try_send(1), Err(Value::Int(1)));
        assert!(ch.try_recv().is_none());
        assert!(!ch.is_ready());
    }

    #[test]
    fn test_channel_buffered_fifo() {
        let ch = channel_buf(3);
        ch.send(1).unwrap();
        ch.send("two").unwrap();
        assert!(ch.try_send(3.0).is_ok());
        assert_eq!(ch.try_send(4), Err(Value::Int(4)));
        assert_eq!(ch.len(), 3);
        assert!(ch.is_ready());

        assert_eq!(ch.recv().unwrap(), Value::Int(1));
        assert_eq!(ch.recv().unwrap(), Value::from("two"));
        assert_eq!(ch.try_recv(), Some(Value::Float(3.0)));
        assert!(ch.try_recv().is_none());
    }

    #[test]
    fn test_buffered_recv_refills_from_blocked_sender() {
        let ch = channel_buf(1);
        ch.send(1).unwrap();
        let tx = Arc::clone(&ch);
        let sender = thread::spawn(move || tx.send(2).unwrap());

        // 等发送者登记
        while ch.state.lock().senders.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ch.recv().unwrap(), Value::Int(1));
        sender.join().unwrap();
        assert_eq!(ch.len(), 1);
        assert_eq!(ch.recv().unwrap(), Value::Int(2));
    }

    #[test]
    fn test_free_wakes_blocked_receiver() {
        let ch = channel();
        let rx = Arc::clone(&ch);
        let receiver = thread::spawn(move || rx.recv());

        while ch.state.lock().receivers.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        let id = ch.id();
        ch.free();
        ch.free();
        assert!(matches!(receiver.join().unwrap(), Err(RuntimeError::ChannelFreed(c)) if c == id));
        assert!(matches!(ch.send(1), Err(RuntimeError::ChannelFreed(_))));
        assert!(ch.try_recv().is_none());
    }

    #[test]
    fn test_registry_tracks_lifetime() {
        let ch = channel_named("probe", 0);
        assert_eq!(ch.name(), Some("probe"));
        assert!(registry().contains_key(&ch.id()));
        let id = ch.id();
        drop(ch);
        assert!(!registry().contains_key(&id));
    }

    #[test]
    fn test_select_try_wait_picks_ready_branch() {
        let a = channel();
        let b = channel_buf(1);
        b.send("ready").unwrap();

        let selected = Select::new().recv(&a).recv(&b).try_wait().unwrap().unwrap();
        assert_eq!(selected.index, 1);
        assert_eq!(selected.value, Some(Value::from("ready")));

        assert!(Select::new().recv(&a).recv(&b).try_wait().unwrap().is_none());
    }

    #[test]
    fn test_select_blocks_until_one_branch() {
        let a = channel();
        let b = channel();
        let tx = Arc::clone(&b);
        let sender = thread::spawn(move || tx.send(9).unwrap());

        let selected = Select::new().recv(&a).recv(&b).wait().unwrap();
        sender.join().unwrap();
        assert_eq!(selected, Selected { index: 1, value: Some(Value::Int(9)) });
        // 未被选中的分支不会留下等待记录
        assert!(a.state.lock().receivers.is_empty());
        assert!(!a.is_ready());
    }

    #[test]
    fn test_for_select_default() {
        let ch = channel();
        let hit = for_select! {
            recv(ch) -> _v => { false },
            default => { true },
        };
        assert!(hit);
    }

    #[test]
    fn test_for_select_recv() {
        let ch = channel_buf(1);
        ch.send(5).unwrap();
        let got = for_select! {
            recv(ch) -> v => { v },
        };
        assert_eq!(got, Value::Int(5));
    }

    #[test]
    fn test_for_select_evaluates_channel_once() {
        let ch = channel_buf(1);
        ch.send(5).unwrap();
        let evals = std::cell::Cell::new(0);
        let pick = || {
            evals.set(evals.get() + 1);
            &ch
        };

        let got = for_select! {
            recv(pick()) -> v => { v },
            default => { Value::Null },
        };
        assert_eq!(got, Value::Int(5));
        assert_eq!(evals.get(), 1);

        let got = for_select! {
            recv(pick()) -> v => { v },
            default => { Value::Null },
        };
        assert_eq!(got, Value::Null);
        assert_eq!(evals.get(), 2);
    }

    #[test]
    fn test_typed_channel() {
        let ch: TypedChannel<i64> = TypedChannel::with_capacity(2);
        assert!(ch.send(42).is_ok());
        assert!(ch.try_send(7));
        assert_eq!(ch.recv(), Some(42));
        assert_eq!(ch.try_recv(), Some(7));
        assert_eq!(ch.try_recv(), None);
    }
}
