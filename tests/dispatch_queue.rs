//! DispatchQueue concurrency bound, ordering and spacing.

use ai_bridge::{DispatchConfig, DispatchQueue};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_never_exceeds_limit() {
    let queue = Arc::new(DispatchQueue::new(&DispatchConfig::new(2)).unwrap());
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let (queue, running, peak) = (queue.clone(), running.clone(), peak.clone());
        handles.push(tokio::spawn(async move {
            queue
                .submit(async {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(queue.in_flight(), 0);
    assert_eq!(queue.queued(), 0);
}

#[tokio::test]
async fn tasks_start_in_submission_order() {
    let queue = Arc::new(DispatchQueue::new(&DispatchConfig::new(1)).unwrap());
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut handles = Vec::new();
    for i in 0..5 {
        let (queue, order) = (queue.clone(), order.clone());
        handles.push(tokio::spawn(async move {
            queue
                .submit(async {
                    order.lock().unwrap().push(i);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                })
                .await
        }));
        // Let each submission reach the semaphore before the next one.
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn post_call_delay_spaces_calls() {
    let config = DispatchConfig::new(1).with_post_call_delay(Duration::from_millis(40));
    let queue = Arc::new(DispatchQueue::new(&config).unwrap());

    let started = Instant::now();
    let (a, b, c) = tokio::join!(
        queue.submit(async { 1 }),
        queue.submit(async { 2 }),
        queue.submit(async { 3 }),
    );
    assert_eq!((a.unwrap(), b.unwrap(), c.unwrap()), (1, 2, 3));
    // Every call holds its slot for the delay, and only one slot exists.
    assert!(started.elapsed() >= Duration::from_millis(120));
}

#[tokio::test]
async fn errors_pass_through_untouched() {
    let queue = DispatchQueue::new(&DispatchConfig::default()).unwrap();
    let out: Result<u32, String> = queue
        .submit(async { Err::<u32, String>("provider down".to_string()) })
        .await
        .unwrap();
    assert_eq!(out, Err("provider down".to_string()));
    assert_eq!(queue.max_concurrency(), 5);
}
