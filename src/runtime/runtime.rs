//! 运行时入口
//!
//! `Runtime::run` 在调用线程上运行主协程（线程 0），
//! 并为其余线程各启动一个 Machine，直到所有协程结束

use std::sync::Arc;

use parking_lot::Mutex;

use super::local;
use super::machine::Machine;
use super::routine::RunMode;
use super::scheduler::{Scheduler, SchedulerStats};
use super::value::Value;
use crate::config::{DEFAULT_QUEUE_SIZE, DEFAULT_STACK_SIZE};
use crate::error::{Result, RuntimeError};

/// 运行时配置
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// 调度线程数（含主线程）
    pub threads: usize,
    /// 协程栈大小
    pub stack_size: usize,
    /// 工作窃取队列初始容量
    pub queue_size: usize,
    /// 是否启用工作窃取
    pub stealing: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            threads: num_cpus::get() + 1,
            stack_size: DEFAULT_STACK_SIZE,
            queue_size: DEFAULT_QUEUE_SIZE,
            stealing: true,
        }
    }
}

impl RuntimeConfig {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_queue_size(mut self, queue_size: usize) -> Self {
        self.queue_size = queue_size;
        self
    }

    pub fn with_stealing(mut self, stealing: bool) -> Self {
        self.stealing = stealing;
        self
    }

    /// 从环境变量读取配置
    ///
    /// `CORUN_THREADS`、`CORUN_STACK_SIZE`、`CORUN_QUEUE_SIZE`、`CORUN_STEALING`，
    /// 无法解析的值被忽略
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    fn from_vars(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(key, value = %raw, "ignoring invalid runtime setting");
                    None
                }
            }
        }

        if let Some(threads) = parse::<usize>("CORUN_THREADS", get("CORUN_THREADS")).filter(|&n| n > 0) {
            config.threads = threads;
        }
        if let Some(size) = parse("CORUN_STACK_SIZE", get("CORUN_STACK_SIZE")) {
            config.stack_size = size;
        }
        if let Some(size) = parse("CORUN_QUEUE_SIZE", get("CORUN_QUEUE_SIZE")) {
            config.queue_size = size;
        }
        if let Some(stealing) = parse("CORUN_STEALING", get("CORUN_STEALING")) {
            config.stealing = stealing;
        }
        config
    }
}

/// 协程运行时
pub struct Runtime {
    config: RuntimeConfig,
    /// 最近一次运行的调度器（用于统计）
    last: Mutex<Option<Arc<Scheduler>>>,
}

impl Runtime {
    /// 创建新的运行时
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            last: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// 以 `f` 为主协程运行（阻塞）
    ///
    /// 所有协程结束后返回主协程的返回值；检测到死锁或未恢复的 panic 时返回错误
    pub fn run<F, R>(&self, f: F) -> Result<Value>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Into<Value>,
    {
        let sched = Arc::new(Scheduler::new(self.config.clone()));
        local::install(Arc::clone(&sched), 0)?;

        let main = sched.create(RunMode::Main, 0, Some(Box::new(move || f().into())));
        main.set_name("main");
        local::push_runnable(Arc::clone(&main));

        let mut machines = Vec::with_capacity(sched.num_threads().saturating_sub(1));
        for id in 1..sched.num_threads() {
            match Machine::start(Arc::clone(&sched), id) {
                Ok(m) => machines.push(m),
                Err(e) => {
                    sched.finish();
                    for m in &machines {
                        m.join();
                    }
                    local::uninstall();
                    return Err(e);
                }
            }
        }

        *self.last.lock() = Some(Arc::clone(&sched));
        sched.start();
        tracing::debug!(threads = sched.num_threads(), "runtime started");

        let outcome = local::run_loop(true);

        sched.finish();
        for m in &machines {
            m.join();
        }
        local::uninstall();
        tracing::debug!(elapsed = ?sched.elapsed(), ok = outcome.is_ok(), "runtime stopped");

        outcome?;
        let rid = main.rid.ok_or(RuntimeError::ResultNotReady(0))?;
        sched.results().get(rid).ok_or(RuntimeError::ResultNotReady(rid))
    }

    /// 最近一次运行的调度统计
    pub fn stats(&self) -> Option<SchedulerStats> {
        self.last.lock().as_ref().map(|s| s.stats())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

/// 程序入口：按环境变量配置运行时，运行 `f(args)`
///
/// 正常结束返回 0，死锁或未恢复的 panic 返回 1
pub fn coro_main<F, R>(args: Vec<String>, f: F) -> i32
where
    F: FnOnce(Vec<String>) -> R + Send + 'static,
    R: Into<Value>,
{
    let runtime = Runtime::new(RuntimeConfig::from_env());
    match runtime.run(move || f(args)) {
        Ok(_) => 0,
        Err(e) => {
            tracing::error!(error = %e, "program failed");
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_runtime_config() {
        let config = RuntimeConfig::default();
        assert_eq!(config.threads, num_cpus::get() + 1);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert!(config.stealing);

        let config = config.with_threads(0).with_stealing(false).with_queue_size(128);
        assert_eq!(config.threads, 1);
        assert!(!config.stealing);
        assert_eq!(config.queue_size, 128);
    }

    #[test]
    fn test_config_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("CORUN_THREADS", "3"),
            ("CORUN_STACK_SIZE", "oops"),
            ("CORUN_STEALING", "false"),
        ]
        .into_iter()
        .collect();
        let config = RuntimeConfig::from_vars(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.threads, 3);
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
        assert_eq!(config.queue_size, DEFAULT_QUEUE_SIZE);
        assert!(!config.stealing);
    }

    #[test]
    fn test_run_returns_main_value() {
        let runtime = Runtime::new(RuntimeConfig::default().with_threads(1));
        assert_eq!(runtime.run(|| 7).unwrap(), Value::Int(7));
        let stats = runtime.stats().unwrap();
        assert_eq!(stats.active, 0);
    }

    #[test]
    fn test_coro_main_exit_codes() {
        assert_eq!(coro_main(vec!["a".into()], |args| args.len()), 0);
        assert_eq!(coro_main(Vec::new(), |_| -> i64 { panic!("main failed") }), 1);
    }
}
