//! Producer/consumer across two runtimes on separate threads, talking
//! through a bounded channel of capacity 5.

use ouro::*;
use std::sync::Arc;

const ITEMS: i32 = 100_000;

fn main() {
    let chan: Arc<Channel<i32>> = Arc::new(Channel::new(5));
    let rt_prod = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());
    let rt_cons = Arc::new(Runtime::new(RuntimeOptions::default()).unwrap());

    let tx = chan.clone();
    let producer = spawn_on(&rt_prod, async move {
        for i in 0..ITEMS {
            assert!(tx.push(i).await);
        }
        println!("producer done: {} items", ITEMS);
    });

    let rx = chan.clone();
    let consumer = spawn_on(&rt_cons, async move {
        let mut expected = 0;
        for _ in 0..ITEMS {
            let v = rx.pop().await;
            assert_eq!(v, expected, "out-of-order delivery");
            expected += 1;
        }
        println!("consumer done: {} items in order", ITEMS);
    });

    rt_prod.allow_exit();
    rt_cons.allow_exit();
    let tp = {
        let rt = rt_prod.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    let tc = {
        let rt = rt_cons.clone();
        std::thread::spawn(move || rt.run().unwrap())
    };
    tp.join().unwrap();
    tc.join().unwrap();
    producer.wait();
    consumer.wait();
}
