//! corun 演示程序
//!
//! 主入口点：运行 waitgroup / channel / async / fib 几个示例场景

use std::env;
use std::process;

use tracing_subscriber::EnvFilter;

use corun::config::{RUNTIME_NAME, VERSION};
use corun::{
    channel, go, result_for, sleepfor, thrd_async, thrd_scope, waitfor, waitgroup, yielding, Result, Runtime,
    RuntimeConfig, RuntimeError, Value,
};

const SCENARIOS: [&str; 4] = ["waitgroup", "channel", "async", "fib"];

/// 场景 A 的工作协程
fn worker(id: u64) -> Value {
    sleepfor(1000);
    match id % 3 {
        0 => Value::Null,
        1 => Value::Int(32),
        _ => Value::from("hello world"),
    }
}

/// 场景 A：50 个协程加入同一个 WaitGroup
fn scenario_waitgroup() -> Result<()> {
    let wg = waitgroup();
    for id in 0..50 {
        go(move || worker(id));
    }

    let Some(rids) = waitfor(&wg) else {
        return Err(RuntimeError::Panicked {
            cid: 0,
            message: "a worker failed".to_string(),
        });
    };

    let (mut ints, mut strings) = (0, 0);
    for &rid in &rids {
        match result_for(rid) {
            Value::Int(n) => {
                assert_eq!(n, 32);
                ints += 1;
            }
            Value::Str(s) => {
                assert_eq!(s, "hello world");
                strings += 1;
            }
            _ => {}
        }
    }
    println!("waitgroup: {} results, {} ints, {} strings", rids.len(), ints, strings);
    Ok(())
}

/// 场景 B：无缓冲 Channel 按顺序传递 0..9
fn scenario_channel() -> Result<()> {
    let ch = channel();
    let tx = ch.clone();
    go(move || -> Option<()> {
        for i in 0..10 {
            tx.send(i).ok()?;
            sleepfor(10);
        }
        Some(())
    });

    for i in 0..10 {
        let value = ch.recv()?;
        assert_eq!(value, Value::Int(i));
    }
    println!("channel: received 0..9 in order");
    Ok(())
}

fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    let mut i = 2;
    while i * i <= n {
        if n % i == 0 {
            return false;
        }
        i += 1;
    }
    true
}

/// 场景 C：在独立线程上判断素数，协程等待期间让出执行权
fn scenario_async() -> Result<()> {
    let future = thrd_async(|| is_prime(194_232_491))?;
    println!("async: done right after spawn = {}", future.is_done());
    let value = future.wait(yielding)?;
    println!("async: is_prime(194232491) = {}", value);
    Ok(())
}

/// fork-join 递归斐波那契
fn fib(n: i64) -> Option<i64> {
    if n < 2 {
        return Some(n);
    }
    let scope = thrd_scope();
    let a = scope.spawn(move || fib(n - 1));
    let b = scope.spawn(move || fib(n - 2));
    scope.sync().ok()?;
    let a = scope.result(a).ok()?.as_int()?;
    let b = scope.result(b).ok()?.as_int()?;
    Some(a + b)
}

/// 场景 D
fn scenario_fib() -> Result<()> {
    let value = thrd_async(|| fib(10))?.wait(yielding)?;
    println!("fib: fib(10) = {}", value);
    Ok(())
}

fn run_scenario(name: &str) -> Result<()> {
    match name {
        "waitgroup" => scenario_waitgroup(),
        "channel" => scenario_channel(),
        "async" => scenario_async(),
        "fib" => scenario_fib(),
        _ => unreachable!("unknown scenario {}", name),
    }
}

/// 打印帮助信息
fn print_help() {
    println!("Usage: {} [scenario]", RUNTIME_NAME);
    println!();
    println!("Scenarios:");
    println!("  waitgroup      50 coroutines in one wait-group");
    println!("  channel        Unbuffered channel ping 0..9");
    println!("  async          Thread future computing a prime test");
    println!("  fib            Fork-join Fibonacci(10)");
    println!("  all            Run every scenario (default)");
    println!();
    println!("Commands:");
    println!("  help           Show this help message");
    println!("  version        Show version information");
    println!();
    println!("Environment:");
    println!("  CORUN_THREADS, CORUN_STACK_SIZE, CORUN_QUEUE_SIZE, CORUN_STEALING, RUST_LOG");
}

/// 打印版本信息
fn print_version() {
    println!("{} {}", RUNTIME_NAME, VERSION);
}

fn run(names: Vec<&'static str>) {
    let runtime = Runtime::new(RuntimeConfig::from_env());
    let outcome = runtime.run(move || -> Value {
        for name in names {
            if let Err(e) = run_scenario(name) {
                tracing::error!(scenario = name, error = %e, "scenario failed");
                return Value::Bool(false);
            }
        }
        Value::Bool(true)
    });

    if let Some(stats) = runtime.stats() {
        tracing::debug!(?stats, "scheduler stats");
    }
    corun::thrd_destroy();

    match outcome {
        Ok(Value::Bool(true)) => {}
        Ok(_) => process::exit(1),
        Err(e) => {
            eprintln!("error: {}", e);
            process::exit(1);
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_thread_names(true)
        .init();

    let args: Vec<String> = env::args().collect();
    let remaining: Vec<&str> = args.iter().skip(1).map(|s| s.as_str()).collect();

    match remaining.as_slice() {
        [] | ["all"] => run(SCENARIOS.to_vec()),
        ["help"] | ["--help"] | ["-h"] => print_help(),
        ["version"] | ["--version"] | ["-v"] => print_version(),
        [name] => match SCENARIOS.iter().find(|s| *s == name) {
            Some(scenario) => run(vec![*scenario]),
            None => {
                print_help();
                process::exit(1);
            }
        },
        _ => {
            print_help();
            process::exit(1);
        }
    }
}
