use criterion::{criterion_group, criterion_main, Criterion};
use ouro::{block_on, spawn, Channel, Runtime, RuntimeOptions};
use std::sync::Arc;

fn bench_channel_throughput(c: &mut Criterion) {
    c.bench_function("channel_pingpong_10k", |b| {
        b.iter(|| {
            let rt = Runtime::new(RuntimeOptions::default()).unwrap();
            let total = block_on(&rt, async {
                let chan: Arc<Channel<u64>> = Arc::new(Channel::new(64));
                let tx = chan.clone();
                let producer = spawn(async move {
                    for i in 0..10_000u64 {
                        assert!(tx.push(i).await);
                    }
                });
                let mut sum = 0u64;
                for _ in 0..10_000 {
                    sum += chan.pop().await;
                }
                producer.await;
                sum
            });
            assert_eq!(total, (0..10_000u64).sum::<u64>());
        });
    });
}

criterion_group!(benches, bench_channel_throughput);
criterion_main!(benches);
