use criterion::{criterion_group, criterion_main, Criterion};
use ouro::{block_on, spawn, Runtime, RuntimeOptions};

fn bench_spawn_join(c: &mut Criterion) {
    c.bench_function("spawn_join_1000", |b| {
        b.iter(|| {
            let rt = Runtime::new(RuntimeOptions::default()).unwrap();
            let sum = block_on(&rt, async {
                let tasks: Vec<_> = (0..1000u64).map(|i| spawn(async move { i })).collect();
                let mut sum = 0u64;
                for task in tasks {
                    sum += task.await;
                }
                sum
            });
            assert_eq!(sum, 499_500);
        });
    });
}

fn bench_spawn_detached(c: &mut Criterion) {
    c.bench_function("spawn_detach_1000", |b| {
        b.iter(|| {
            let rt = Runtime::new(RuntimeOptions::default()).unwrap();
            block_on(&rt, async {
                for _ in 0..1000 {
                    spawn(async {}).detach();
                }
            });
        });
    });
}

criterion_group!(benches, bench_spawn_join, bench_spawn_detached);
criterion_main!(benches);
