//! 调度器、Channel 与失败处理的多线程行为

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use corun::{
    await_result, channel, channel_buf, coro_active, coro_id, defer, for_select, go, launch, result_for,
    sleepfor, stack_check, waitfor, waitgroup, yielding, Runtime, RuntimeConfig, RuntimeError, Select, Value,
};

fn runtime(threads: usize) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_threads(threads))
}

#[test]
fn test_deadlock_is_reported() {
    let err = runtime(2)
        .run(|| {
            let ch = channel();
            ch.recv().unwrap()
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Deadlock { active: 1 }), "got {:?}", err);
}

#[test]
fn test_deadlock_between_coroutines() {
    let err = runtime(3)
        .run(|| {
            let a = channel();
            let b = channel();
            let (a2, b2) = (a.clone(), b.clone());
            go(move || {
                b2.recv().unwrap();
                a2.send(1).unwrap();
            });
            a.recv().unwrap();
            b.send(2).unwrap();
        })
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Deadlock { .. }), "got {:?}", err);
}

#[test]
fn test_coroutine_waits_for_thread_that_sends_later() {
    let result = runtime(2)
        .run(|| {
            let ch = channel();
            let tx = ch.clone();
            // 协程先阻塞，线程稍后才发送
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                tx.send(1).unwrap();
            });
            ch.recv().unwrap()
        })
        .unwrap();
    assert_eq!(result, Value::Int(1));
}

#[test]
fn test_sleep_wakes_in_deadline_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&order);
    runtime(1)
        .run(move || {
            let wg = waitgroup();
            for (tag, ms) in [(3, 60u64), (1, 10), (2, 30)] {
                let log = Arc::clone(&log);
                go(move || {
                    sleepfor(ms);
                    log.lock().push(tag);
                });
            }
            waitfor(&wg);
        })
        .unwrap();
    assert_eq!(*order.lock(), vec![1, 2, 3]);
}

#[test]
fn test_sleep_duration() {
    let start = Instant::now();
    runtime(2).run(|| sleepfor(50)).unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_yield_is_fair() {
    let result = runtime(1)
        .run(|| {
            let turns = Arc::new(AtomicUsize::new(0));
            let other = Arc::clone(&turns);
            go(move || {
                for _ in 0..5 {
                    other.fetch_add(1, Ordering::SeqCst);
                    yielding();
                }
            });
            // 让出后另一个协程必须得到运行
            for _ in 0..10 {
                yielding();
            }
            turns.load(Ordering::SeqCst)
        })
        .unwrap();
    assert_eq!(result, Value::Int(5));
}

#[test]
fn test_buffered_channel_fifo_and_blocking() {
    let result = runtime(2)
        .run(|| {
            let ch = channel_buf(2);
            let sent_all = Arc::new(AtomicBool::new(false));

            let tx = ch.clone();
            let flag = Arc::clone(&sent_all);
            go(move || {
                for i in 0..3 {
                    tx.send(i).unwrap();
                }
                flag.store(true, Ordering::SeqCst);
            });

            sleepfor(30);
            // 第三次发送在缓冲区满时阻塞
            assert!(!sent_all.load(Ordering::SeqCst));
            assert_eq!(ch.len(), 2);

            let got: Vec<Value> = (0..3).map(|_| ch.recv().unwrap()).collect();
            assert_eq!(got, vec![Value::Int(0), Value::Int(1), Value::Int(2)]);
            while !sent_all.load(Ordering::SeqCst) {
                yielding();
            }
            true
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_try_send_on_full_buffer() {
    let ch = channel_buf(2);
    assert!(ch.try_send(1).is_ok());
    assert!(ch.try_send(2).is_ok());
    assert_eq!(ch.try_send(3), Err(Value::Int(3)));
    assert_eq!(ch.try_recv(), Some(Value::Int(1)));
    assert!(ch.try_send(3).is_ok());
    assert_eq!(ch.try_recv(), Some(Value::Int(2)));
    assert_eq!(ch.try_recv(), Some(Value::Int(3)));
    assert_eq!(ch.try_recv(), None);
}

#[test]
fn test_select_picks_ready_branch() {
    let result = runtime(2)
        .run(|| {
            let a = channel();
            let b = channel();
            let tx = b.clone();
            go(move || {
                sleepfor(10);
                tx.send("from b").unwrap();
            });

            let selected = Select::new().recv(&a).recv(&b).wait().unwrap();
            assert_eq!(selected.index, 1);
            selected.value.unwrap_or_default()
        })
        .unwrap();
    assert_eq!(result, Value::from("from b"));
}

#[test]
fn test_select_send_branch() {
    let result = runtime(2)
        .run(|| {
            let out = channel();
            let rx = out.clone();
            go(move || rx.recv().unwrap());

            let idle = channel();
            let selected = Select::new().recv(&idle).send(&out, 7).wait().unwrap();
            assert_eq!(selected.index, 1);
            assert!(selected.value.is_none());
            assert!(Select::new().recv(&idle).try_wait().unwrap().is_none());
            true
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_for_select_loop() {
    let result = runtime(2)
        .run(|| {
            let ch = channel_buf(1);
            let empty = channel();

            let polled = for_select! {
                recv(empty) -> v => { Some(v) },
                default => { None },
            };
            assert!(polled.is_none());

            let tx = ch.clone();
            go(move || {
                sleepfor(10);
                tx.send(5).unwrap();
            });
            let got = for_select! {
                recv(empty) -> _v => { Value::Null },
                recv(ch) -> v => { v },
            };
            got
        })
        .unwrap();
    assert_eq!(result, Value::Int(5));
}

#[test]
fn test_grouped_panic_is_contained() {
    let cleaned = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cleaned);
    let result = runtime(2)
        .run(move || {
            let wg = waitgroup();
            go(|| 1);
            go(move || -> i64 {
                defer(move || flag.store(true, Ordering::SeqCst));
                panic!("worker failed");
            });
            go(|| {
                sleepfor(10);
                2
            });
            waitfor(&wg).is_none()
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
    assert!(cleaned.load(Ordering::SeqCst));
}

#[test]
fn test_ungrouped_panic_aborts_run() {
    let err = runtime(2)
        .run(|| {
            go(|| -> i64 { panic!("nobody is waiting") });
            sleepfor(1000);
        })
        .unwrap_err();
    match err {
        RuntimeError::Panicked { message, .. } => assert_eq!(message, "nobody is waiting"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[test]
fn test_main_panic_aborts_run() {
    let err = runtime(1).run(|| -> i64 { panic!("main failed") }).unwrap_err();
    assert!(matches!(err, RuntimeError::Panicked { .. }));
}

#[test]
fn test_stack_check_fails_coroutine() {
    let result = runtime(2)
        .run(|| {
            let wg = waitgroup();
            go(|| 1);
            go(|| stack_check(usize::MAX));
            waitfor(&wg).is_none()
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_launched_panic_surfaces_through_await() {
    let result = runtime(2)
        .run(|| {
            let rid = launch(|| -> i64 { panic!("launch failed") });
            let failed = matches!(await_result(rid), Err(RuntimeError::Panicked { .. }));
            let next = launch(|| 3);
            failed && await_result(next).unwrap() == Value::Int(3)
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_freed_channel_wakes_waiters() {
    let result = runtime(2)
        .run(|| {
            let ch = channel();
            let rx = ch.clone();
            let rid = launch(move || matches!(rx.recv(), Err(RuntimeError::ChannelFreed(_))));

            sleepfor(20);
            ch.free();
            assert!(ch.is_freed());
            assert!(matches!(ch.send(1), Err(RuntimeError::ChannelFreed(id)) if id == ch.id()));
            await_result(rid).unwrap()
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_launch_and_await() {
    let result = runtime(3)
        .run(|| {
            let rids: Vec<_> = (0..10i64)
                .map(|i| {
                    launch(move || {
                        sleepfor(5);
                        i * i
                    })
                })
                .collect();
            rids.into_iter()
                .map(|rid| await_result(rid).unwrap().as_int().unwrap())
                .sum::<i64>()
        })
        .unwrap();
    assert_eq!(result, Value::Int(285));
}

#[test]
fn test_result_for_before_completion_panics() {
    let result = runtime(2)
        .run(|| {
            let rid = launch(|| {
                sleepfor(50);
                1
            });
            assert!(std::panic::catch_unwind(|| result_for(rid)).is_err());
            await_result(rid).unwrap()
        })
        .unwrap();
    assert_eq!(result, Value::Int(1));
}

#[test]
fn test_defer_runs_in_reverse_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let inner = Arc::clone(&log);
    runtime(1)
        .run(move || {
            let wg = waitgroup();
            go(move || {
                let first = Arc::clone(&inner);
                let second = Arc::clone(&inner);
                defer(move || first.lock().push("first"));
                defer(move || second.lock().push("second"));
                inner.lock().push("body");
            });
            waitfor(&wg);
        })
        .unwrap();
    assert_eq!(*log.lock(), vec!["body", "second", "first"]);
}

#[test]
fn test_many_coroutines_across_threads() {
    let config = RuntimeConfig::default().with_threads(4).with_queue_size(16);
    let runtime = Runtime::new(config);
    let result = runtime
        .run(|| {
            let wg = waitgroup();
            for i in 0..500i64 {
                go(move || {
                    for _ in 0..3 {
                        yielding();
                    }
                    i
                });
            }
            let rids = waitfor(&wg).unwrap();
            rids.into_iter()
                .map(|rid| result_for(rid).as_int().unwrap())
                .sum::<i64>()
        })
        .unwrap();
    assert_eq!(result, Value::Int(500 * 499 / 2));

    let stats = runtime.stats().unwrap();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.processors.len(), 4);
}

#[test]
fn test_single_thread_without_stealing() {
    let config = RuntimeConfig::default().with_threads(1).with_stealing(false);
    let result = Runtime::new(config)
        .run(|| {
            assert!(coro_id().is_some());
            let ch = channel();
            let tx = ch.clone();
            go(move || {
                for i in 0..100 {
                    tx.send(i).unwrap();
                }
            });
            let sum: i64 = (0..100).map(|_| ch.recv().unwrap().as_int().unwrap()).sum();
            assert!(coro_active() >= 1);
            sum
        })
        .unwrap();
    assert_eq!(result, Value::Int(4950));
}

#[test]
fn test_channel_between_coroutine_and_thread() {
    let ch = channel_buf(5);
    let rx = ch.clone();
    // OS 线程上的接收方阻塞在线程上，而不是协程上
    let consumer = std::thread::spawn(move || (0..5).map(|_| rx.recv().unwrap().as_int().unwrap()).sum::<i64>());

    runtime(2)
        .run(move || {
            for i in 0..5 {
                ch.send(i).unwrap();
            }
        })
        .unwrap();
    assert_eq!(consumer.join().unwrap(), 10);
}
