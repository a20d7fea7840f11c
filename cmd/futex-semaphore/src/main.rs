//! A counting semaphore derived from the runtime's futex wait/wake ops:
//! workers suspend in the kernel instead of spinning when no permit is
//! available. Eight workers share two permits.

use ouro::*;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

struct Semaphore {
    permits: AtomicU32,
}

impl Semaphore {
    fn new(permits: u32) -> Self {
        Self {
            permits: AtomicU32::new(permits),
        }
    }

    async fn acquire(&self) {
        loop {
            let current = self.permits.load(Ordering::Acquire);
            if current > 0 {
                if self
                    .permits
                    .compare_exchange(current, current - 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            // Sleeps until a release changes the word (or we raced a wake).
            async_futex_wait(&self.permits, 0).await;
        }
    }

    async fn release(&self) {
        self.permits.fetch_add(1, Ordering::AcqRel);
        async_futex_wake(&self.permits, 1).await;
    }
}

fn main() {
    let rt = Runtime::new(RuntimeOptions::default()).unwrap();
    if !rt.features().futex {
        eprintln!("kernel lacks io_uring futex ops (needs 6.7+)");
        std::process::exit(1);
    }

    let sem = Arc::new(Semaphore::new(2));
    let active = Arc::new(AtomicUsize::new(0));

    block_on(&rt, async move {
        let mut workers = Vec::new();
        for id in 0..8 {
            let sem = sem.clone();
            let active = active.clone();
            workers.push(spawn(async move {
                sem.acquire().await;
                let now = active.fetch_add(1, Ordering::AcqRel) + 1;
                assert!(now <= 2, "semaphore admitted {} workers", now);
                println!("worker {} holds a permit ({} active)", id, now);
                async_timeout(Duration::from_millis(20), 0, TimeoutFlags::empty()).await;
                active.fetch_sub(1, Ordering::AcqRel);
                sem.release().await;
            }));
        }
        for worker in workers {
            worker.await;
        }
        println!("all workers done");
    });
}
