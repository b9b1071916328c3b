//! 配置常量模块
//!
//! 运行时相关的常量都在这里定义，便于后期修改

use std::time::Duration;

/// 运行时名称
pub const RUNTIME_NAME: &str = "corun";

/// 版本号
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 协程栈最小大小：16KB
pub const MIN_STACK_SIZE: usize = 16 * 1024;

/// 协程栈默认大小：256KB（按需提交，实际占用远小于此）
pub const DEFAULT_STACK_SIZE: usize = 256 * 1024;

/// 栈对齐：16 字节
pub const STACK_ALIGN: usize = 16;

/// 栈溢出检测用的魔数
pub const STACK_CANARY: u64 = 0x0C0F_FEE0_DEAD_BEEF;

/// 调用 `stack_check` 时默认要求的剩余栈空间
pub const STACK_CHECK_MARGIN: usize = 4 * 1024;

/// 工作窃取队列初始容量（必须是 2 的幂）
pub const DEFAULT_QUEUE_SIZE: usize = 64;

/// 空闲线程单次休眠上限
pub const IDLE_PARK: Duration = Duration::from_millis(10);

/// 判定死锁前所有协程持续阻塞且没有交汇进展的时长
///
/// 协程之外的线程可能稍后才对 Channel 进行操作
pub const DEADLOCK_GRACE: Duration = Duration::from_millis(250);

/// 线程池任务队列容量
pub const POOL_QUEUE_SIZE: usize = 1024;

/// 线程池最大线程数相对 CPU 核心数的倍数
pub const POOL_THREADS_PER_CPU: usize = 2;
