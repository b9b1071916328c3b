//! 协程运行时模块
//!
//! M:N 有栈协程调度系统
//!
//! 核心组件：
//! - Routine: 协程记录，执行体（栈和上下文）由所属线程持有
//! - Processor: 每个调度线程的共享状态（可窃取队列、收件箱、休眠/唤醒）
//! - Machine: 操作系统线程，运行调度循环
//! - Scheduler: 一次运行时会话的全局状态

pub mod channel;
pub mod context;
pub mod deque;
pub mod future;
pub mod local;
pub mod machine;
pub mod processor;
pub mod queue;
pub mod result;
pub mod routine;
pub mod runtime;
pub mod scheduler;
pub mod spin;
pub mod stack;
pub mod value;
pub mod waitgroup;

pub use channel::{chan_free, chan_recv, chan_send, channel, channel_buf, channel_named, Chan, Channel, Select, Selected, TypedChannel};
pub use future::{thrd_async, thrd_destroy, thrd_for, thrd_get, thrd_is_done, thrd_result, thrd_scope, thrd_spawn, thrd_sync, thrd_wait, Future, Scope, TaskId};
pub use local::{coro_active, coro_id, current, defer, go, launch, sleepfor, yielding};
pub use processor::{Processor, ProcessorStatus};
pub use result::{await_result, result_for, try_result_for};
pub use routine::{Co, RoutineStatus, RunMode, Routine};
pub use runtime::{coro_main, Runtime, RuntimeConfig};
pub use scheduler::{Scheduler, SchedulerStats};
pub use stack::stack_check;
pub use value::Value;
pub use waitgroup::{waitfor, waitgroup, WaitGroup};

/// 获取当前 CPU 核心数
pub fn num_processors() -> usize {
    num_cpus::get()
}
