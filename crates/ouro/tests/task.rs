//! Task lifecycle: join, detach, panic capture, cross-runtime handoff.

use ouro::*;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[test]
fn block_on_returns_the_future_result() {
    assert_eq!(block_on_default(async { 1 + 2 }), 3);
}

#[test]
fn spawned_tasks_join_in_order() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let values = block_on(&rt, async {
        let a = spawn(async { 10 });
        let b = spawn(async { 20 });
        let c = spawn(async { 30 });
        (a.await, b.await, c.await)
    });
    assert_eq!(values, (10, 20, 30));
}

#[test]
fn detached_task_runs_to_completion() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let ran = Arc::new(AtomicBool::new(false));
    let ran2 = ran.clone();
    block_on(&rt, async move {
        spawn(async move {
            async_nop().await;
            ran2.store(true, Ordering::Release);
        })
        .detach();
        // Give the detached task a chance to finish before we return.
        async_timeout(Duration::from_millis(5), 0, TimeoutFlags::empty()).await;
    });
    assert!(ran.load(Ordering::Acquire));
}

#[test]
fn task_panic_is_rethrown_at_wait() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let task = spawn_on(&rt, async {
        panic!("boom in task");
    });
    rt.allow_exit();
    rt.run().unwrap();
    let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.wait()));
    let payload = caught.unwrap_err();
    let msg = payload.downcast_ref::<&str>().copied().unwrap_or_default();
    assert!(msg.contains("boom in task"), "unexpected payload: {}", msg);
}

#[test]
fn task_panic_is_rethrown_at_await() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let outcome = block_on(&rt, async {
        let failing = spawn(async {
            panic!("inner failure");
        });
        // Yield so the failing task runs to completion first.
        async_nop().await;
        // Awaiting rethrows into this coroutine; catch at the join point.
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            futures_block_one(failing)
        }));
        caught.is_err()
    });
    assert!(outcome);
}

/// Minimal poll-once adapter: the failing task has already finished by the
/// time the nop below resolves, so one poll observes the panic.
fn futures_block_one<T>(task: Task<T>) -> T {
    use std::future::Future;
    use std::pin::pin;
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop_raw() -> RawWaker {
        static VTABLE: RawWakerVTable =
            RawWakerVTable::new(|_| noop_raw(), |_| {}, |_| {}, |_| {});
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    let waker = unsafe { Waker::from_raw(noop_raw()) };
    let mut cx = Context::from_waker(&waker);
    let mut task = pin!(task);
    loop {
        match task.as_mut().poll(&mut cx) {
            Poll::Ready(v) => return v,
            Poll::Pending => std::thread::yield_now(),
        }
    }
}

#[test]
fn wait_outside_runtime_blocks_until_done() {
    let rt = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());
    let task = spawn_on(&rt, async {
        async_timeout(Duration::from_millis(20), 0, TimeoutFlags::empty()).await;
        77
    });
    rt.allow_exit();
    let rt2 = rt.clone();
    let loop_thread = std::thread::spawn(move || rt2.run().unwrap());
    assert_eq!(task.wait(), 77);
    loop_thread.join().unwrap();
}

#[test]
fn switch_to_moves_the_coroutine() {
    let rt_a = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());
    let rt_b = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());

    let rt_b_for_task = rt_b.clone();
    let task = spawn_on(&rt_a, async move {
        let before = std::thread::current().id();
        switch_to(&rt_b_for_task).await;
        let after = std::thread::current().id();
        // The target runtime owns the loop from here; let it exit.
        rt_b_for_task.allow_exit();
        (before, after)
    });

    rt_a.allow_exit();
    let ja = {
        let rt = rt_a.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    let jb = {
        let rt = rt_b.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    let (before, after) = task.wait();
    ja.join().unwrap();
    jb.join().unwrap();
    assert_ne!(before, after, "coroutine stayed on the same thread");
}

#[test]
fn switch_to_current_runtime_is_a_noop() {
    let rt = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());
    let rt2 = rt.clone();
    let value = block_on(&rt, async move {
        switch_to(&rt2).await;
        5
    });
    assert_eq!(value, 5);
}

#[test]
fn awaitable_reports_handle_state() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let task = spawn_on(&rt, async { 1 });
    assert!(task.awaitable());
    task.detach();
    rt.allow_exit();
    rt.run().unwrap();
}

#[test]
fn tasks_spawned_before_run_execute() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    let hit = Arc::new(AtomicBool::new(false));
    let hit2 = hit.clone();
    let task = spawn_on(&rt, async move {
        hit2.store(true, Ordering::Release);
    });
    rt.allow_exit();
    rt.run().unwrap();
    task.wait();
    assert!(hit.load(Ordering::Acquire));
}
