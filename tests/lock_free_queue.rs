use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use tasktimer::LockFreeQueue;

#[test]
fn test_queue_preserves_fifo_order() {
    let queue = LockFreeQueue::new();
    for i in 0..100 {
        queue.push(i);
    }

    let drained: Vec<i32> = std::iter::from_fn(|| queue.pop()).collect();
    assert_eq!(drained, (0..100).collect::<Vec<_>>(), "Queue should be FIFO");
    assert!(queue.is_empty());
}

#[test]
fn test_queue_concurrent_producers_lose_nothing() {
    concurrent_producers(10_000);
}

#[test]
#[ignore = "pushes about ten million items; run with --ignored"]
fn test_queue_concurrent_producers_million_each() {
    concurrent_producers(1_000_000);
}

// Ten producers push `base + t` items each, then a single thread drains them.
fn concurrent_producers(base: usize) {
    const THREADS: usize = 10;

    let queue = Arc::new(LockFreeQueue::new());
    let producers: Vec<_> = (0..THREADS)
        .map(|t| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..base + t {
                    queue.push((t, i));
                }
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let expected: usize = (0..THREADS).map(|t| base + t).sum();
    assert_eq!(queue.size(), expected);
    assert_eq!(queue.stat_size(), expected);

    let mut popped = 0;
    let mut last = vec![None; THREADS];
    while let Some((t, i)) = queue.pop() {
        // Per-producer order survives interleaving.
        if let Some(prev) = last[t] {
            assert!(i > prev, "Items from one producer should stay ordered");
        }
        last[t] = Some(i);
        popped += 1;
    }

    assert_eq!(popped, expected, "Every pushed item should be popped exactly once");
    assert_eq!(queue.size(), 0);
}

#[test]
fn test_queue_concurrent_push_and_pop() {
    const PER_THREAD: usize = 20_000;

    let queue = Arc::new(LockFreeQueue::new());
    let producers: Vec<_> = (0..4)
        .map(|t| {
            let queue = queue.clone();
            thread::spawn(move || {
                for i in 0..PER_THREAD {
                    queue.push(t * PER_THREAD + i);
                }
            })
        })
        .collect();

    let consumers: Vec<_> = (0..4)
        .map(|_| {
            let queue = queue.clone();
            thread::spawn(move || {
                let mut seen = Vec::new();
                while seen.len() < PER_THREAD {
                    match queue.pop() {
                        Some(value) => seen.push(value),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        })
        .collect();

    for producer in producers {
        producer.join().unwrap();
    }

    let mut all = HashSet::new();
    for consumer in consumers {
        for value in consumer.join().unwrap() {
            assert!(all.insert(value), "Value {value} popped twice");
        }
    }

    assert_eq!(all.len(), 4 * PER_THREAD);
    assert!(queue.pop().is_none());
}

#[test]
fn test_queue_drops_remaining_items() {
    let marker = Arc::new(());
    {
        let queue = LockFreeQueue::new();
        for _ in 0..10 {
            queue.push(marker.clone());
        }
        drop(queue.pop());
    }
    assert_eq!(Arc::strong_count(&marker), 1, "Dropping the queue should drop its items");
}
