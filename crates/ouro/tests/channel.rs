//! Channel behaviour across runtimes.

use ouro::*;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> Arc<Runtime> {
    Arc::new(Runtime::new(RuntimeOptions::default()).unwrap())
}

#[test]
fn producer_consumer_across_two_runtimes() {
    const N: i32 = 200;
    let chan: Arc<Channel<i32>> = Arc::new(Channel::new(5));
    let rt_a = runtime();
    let rt_b = runtime();

    let ca = chan.clone();
    let producer = spawn_on(&rt_a, async move {
        for i in 0..N {
            assert!(ca.push(i).await);
        }
    });

    let cb = chan.clone();
    let consumer = spawn_on(&rt_b, async move {
        let mut seen = Vec::with_capacity(N as usize);
        for _ in 0..N {
            seen.push(cb.pop().await);
        }
        seen
    });

    rt_a.allow_exit();
    rt_b.allow_exit();
    let ta = {
        let rt = rt_a.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    let tb = {
        let rt = rt_b.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    ta.join().unwrap();
    tb.join().unwrap();

    producer.wait();
    let seen = consumer.wait();
    assert_eq!(seen, (0..N).collect::<Vec<_>>());
    assert_eq!(rt_a.pending_works(), 0);
    assert_eq!(rt_b.pending_works(), 0);
}

#[test]
fn conservation_under_mpmc_stress() {
    const PER_PRODUCER: usize = 500;
    let chan: Arc<Channel<u64>> = Arc::new(Channel::new(8));
    let rt_a = runtime();
    let rt_b = runtime();

    let mut producers = Vec::new();
    for p in 0..2u64 {
        let c = chan.clone();
        producers.push(spawn_on(&rt_a, async move {
            for i in 0..PER_PRODUCER as u64 {
                assert!(c.push(p * 1_000_000 + i + 1).await);
            }
        }));
    }
    let mut consumers = Vec::new();
    for _ in 0..2 {
        let c = chan.clone();
        consumers.push(spawn_on(&rt_b, async move {
            let mut sum = 0u64;
            let mut count = 0usize;
            for _ in 0..PER_PRODUCER {
                let v = c.pop().await;
                assert_ne!(v, 0, "closed-channel default leaked into the stream");
                sum += v;
                count += 1;
            }
            (sum, count)
        }));
    }

    rt_a.allow_exit();
    rt_b.allow_exit();
    let ta = {
        let rt = rt_a.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    let tb = {
        let rt = rt_b.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    ta.join().unwrap();
    tb.join().unwrap();

    for p in producers {
        p.wait();
    }
    let mut total = 0u64;
    let mut popped = 0usize;
    for c in consumers {
        let (sum, count) = c.wait();
        total += sum;
        popped += count;
    }
    // pushes == pops, and every pushed value arrived exactly once.
    assert_eq!(popped, 2 * PER_PRODUCER);
    let expected: u64 = (0..2u64)
        .flat_map(|p| (0..PER_PRODUCER as u64).map(move |i| p * 1_000_000 + i + 1))
        .sum();
    assert_eq!(total, expected);
    assert_eq!(chan.len(), 0);
}

#[test]
fn rendezvous_channel_hands_off_directly() {
    let chan: Arc<Channel<i32>> = Arc::new(Channel::new(0));
    let rt = runtime();

    let c1 = chan.clone();
    let pusher = spawn_on(&rt, async move {
        assert!(c1.push(42).await);
    });
    let c2 = chan.clone();
    let popper = spawn_on(&rt, async move { c2.pop().await });

    rt.allow_exit();
    rt.run().unwrap();
    pusher.wait();
    assert_eq!(popper.wait(), 42);
    assert_eq!(chan.len(), 0);
}

#[test]
fn close_wakes_pending_poppers_with_default() {
    let chan: Arc<Channel<i32>> = Arc::new(Channel::new(2));
    let rt = runtime();

    let c1 = chan.clone();
    let popper = spawn_on(&rt, async move { c1.pop().await });
    let c2 = chan.clone();
    let closer = spawn_on(&rt, async move {
        // Let the popper suspend first.
        async_timeout(Duration::from_millis(10), 0, TimeoutFlags::empty()).await;
        c2.push_close();
    });

    rt.allow_exit();
    rt.run().unwrap();
    closer.wait();
    assert_eq!(popper.wait(), 0);
    assert!(chan.is_closed());
}

#[test]
fn cancelled_pop_leaves_channel_clean() {
    let chan: Arc<Channel<i32>> = Arc::new(Channel::new(2));
    let rt = runtime();

    let c1 = chan.clone();
    let racer = spawn_on(&rt, async move {
        // The nop wins instantly; the pop waiter is removed before it is
        // ever woken.
        match any((c1.pop(), async_nop())).await {
            AnyOf2::Second(res) => assert_eq!(res, 0),
            AnyOf2::First(v) => panic!("empty channel produced {}", v),
        }
        // The channel still works afterwards.
        assert!(c1.try_push(7));
        assert_eq!(c1.try_pop(), Some(7));
    });

    rt.allow_exit();
    rt.run().unwrap();
    racer.wait();
    assert_eq!(rt.pending_works(), 0);
}

#[test]
fn force_push_from_callback_reaches_pop() {
    let rt = runtime();
    let got = block_on(&rt, async {
        let chan = Channel::new(1);
        // will_push routes a completion result into the channel without
        // back-pressure, as multishot callbacks do.
        let mut push = will_push(&chan);
        push(33);
        chan.pop().await
    });
    assert_eq!(got, 33);
}

#[test]
fn push_pop_composes_with_io_ops() {
    let rt = runtime();
    let (winner_is_pop, value) = block_on(&rt, async {
        let chan: Channel<i32> = Channel::new(1);
        chan.force_push(5);
        match any((
            chan.pop(),
            async_timeout(Duration::from_secs(60), 0, TimeoutFlags::empty()),
        ))
        .await
        {
            AnyOf2::First(v) => (true, v),
            AnyOf2::Second(_) => (false, 0),
        }
    });
    assert!(winner_is_pop);
    assert_eq!(value, 5);
}
