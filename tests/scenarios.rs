//! 端到端场景：WaitGroup、Channel、线程 Future、fork-join

use corun::{
    channel, go, result_for, sleepfor, thrd_async, thrd_get, thrd_is_done, thrd_scope, waitfor, waitgroup,
    yielding, Runtime, RuntimeConfig, Value,
};

fn runtime(threads: usize) -> Runtime {
    Runtime::new(RuntimeConfig::default().with_threads(threads))
}

fn worker(id: u64) -> Value {
    sleepfor(200);
    match id % 3 {
        0 => Value::Null,
        1 => Value::Int(32),
        _ => Value::from("hello world"),
    }
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

fn fib(n: i64) -> Option<i64> {
    if n < 2 {
        return Some(n);
    }
    let scope = thrd_scope();
    let a = scope.spawn(move || fib(n - 1));
    let b = scope.spawn(move || fib(n - 2));
    scope.sync().ok()?;
    Some(scope.result(a).ok()?.as_int()? + scope.result(b).ok()?.as_int()?)
}

#[test]
fn test_waitgroup_of_fifty_workers() {
    let result = runtime(4)
        .run(|| {
            let wg = waitgroup();
            for id in 0..50 {
                go(move || worker(id));
            }
            let rids = waitfor(&wg).expect("no worker panicked");
            assert_eq!(rids.len(), 50);

            let mut ints = 0;
            let mut strings = 0;
            for (id, &rid) in rids.iter().enumerate() {
                match (id % 3, result_for(rid)) {
                    (0, Value::Null) => {}
                    (1, Value::Int(n)) => {
                        assert_eq!(n, 32);
                        ints += 1;
                    }
                    (2, Value::Str(s)) => {
                        assert_eq!(s, "hello world");
                        strings += 1;
                    }
                    (id, other) => panic!("worker {} returned {:?}", id, other),
                }
            }
            ints + strings
        })
        .unwrap();
    assert_eq!(result, Value::Int(33));
}

#[test]
fn test_unbuffered_channel_in_order() {
    let result = runtime(4)
        .run(|| {
            let ch = channel();
            let tx = ch.clone();
            go(move || {
                for i in 0..10 {
                    tx.send(i).unwrap();
                    sleepfor(5);
                }
            });
            for i in 0..10 {
                assert_eq!(ch.recv().unwrap(), Value::Int(i));
            }
            true
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_thread_future_inside_coroutine() {
    let result = runtime(2)
        .run(|| {
            let future = thrd_async(|| is_prime(194_232_491)).unwrap();
            // 刚创建时可能已经完成，只要求不会 panic
            let _ = thrd_is_done(&future);
            future.wait(yielding).unwrap()
        })
        .unwrap();
    assert_eq!(result, Value::Bool(true));
}

#[test]
fn test_thread_future_outside_runtime() {
    let future = thrd_async(|| is_prime(194_232_491)).unwrap();
    assert_eq!(thrd_get(future).unwrap(), Value::Bool(true));

    let future = thrd_async(|| is_prime(194_232_490)).unwrap();
    assert_eq!(thrd_get(future).unwrap(), Value::Bool(false));
}

#[test]
fn test_fork_join_fibonacci() {
    assert_eq!(fib(10), Some(55));

    let result = runtime(2)
        .run(|| thrd_async(|| fib(10)).unwrap().wait(yielding).unwrap())
        .unwrap();
    assert_eq!(result, Value::Int(55));
}
