//! corun: 协作式有栈协程运行时
//!
//! 提供 `go` 风格的协程、带工作窃取的多线程调度、CSP 风格的 Channel 与 select、
//! WaitGroup 以及基于线程的 future / fork-join。
//!
//! ```ignore
//! use corun::{channel, go, Runtime, RuntimeConfig};
//!
//! let runtime = Runtime::new(RuntimeConfig::default());
//! let sum = runtime.run(|| {
//!     let ch = channel();
//!     let tx = ch.clone();
//!     go(move || {
//!         for i in 0..10 {
//!             tx.send(i).unwrap();
//!         }
//!     });
//!     (0..10).map(|_| ch.recv().unwrap().as_int().unwrap()).sum::<i64>()
//! });
//! ```

pub mod config;
pub mod error;
pub mod runtime;

pub use error::{Cid, Result, Rid, RuntimeError};
pub use runtime::{
    await_result, chan_free, chan_recv, chan_send, channel, channel_buf, channel_named, coro_active, coro_id,
    coro_main, current, defer, go, launch, num_processors, result_for, sleepfor, stack_check, thrd_async,
    thrd_destroy, thrd_for, thrd_get, thrd_is_done, thrd_result, thrd_scope, thrd_spawn, thrd_sync, thrd_wait,
    try_result_for, waitfor, waitgroup, yielding,
};
pub use runtime::{
    Chan, Channel, Co, Future, Routine, RoutineStatus, RunMode, Runtime, RuntimeConfig, Scope, Select, Selected,
    SchedulerStats, TaskId, TypedChannel, Value, WaitGroup,
};
