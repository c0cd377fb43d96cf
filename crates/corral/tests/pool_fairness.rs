use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use corral::Corral;
use tokio::time::sleep;

mod support;
use support::TestFactory;

/// Twelve workers hammer a three-session pool. Every acquire must land
/// within its budget: the fair permit queue serves waiters in arrival
/// order, so no worker can be starved by the others' churn.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_worker_starves_under_contention() -> anyhow::Result<()> {
    const WORKERS: usize = 12;
    const ROUNDS: usize = 3;

    let factory = TestFactory::new();
    let pool = Corral::new().max_sessions(3).open(factory).await?;

    let total_wait_ms = Arc::new(AtomicU64::new(0));
    let mut handles = Vec::new();
    for worker in 0..WORKERS {
        let pool = pool.clone();
        let total_wait_ms = Arc::clone(&total_wait_ms);
        handles.push(tokio::spawn(async move {
            for round in 0..ROUNDS {
                let started = Instant::now();
                let lease = pool
                    .acquire_timeout(Duration::from_secs(10))
                    .await
                    .unwrap_or_else(|err| panic!("worker {worker} starved in round {round}: {err}"));
                total_wait_ms.fetch_add(started.elapsed().as_millis() as u64, Ordering::Relaxed);

                {
                    let session = lease.session().await.expect("session revoked");
                    assert!(session.id >= 1);
                }
                // simulate a short transaction before committing
                sleep(Duration::from_millis(((worker + round) % 3) as u64 + 2)).await;
                lease.release().await;
            }
        }));
    }

    for handle in handles {
        handle.await.expect("worker panicked");
    }

    assert!(pool.size() <= 3);
    assert_eq!(pool.num_used(), 0);
    assert_eq!(pool.stats().created, pool.size() as u64);

    // sanity on the waits themselves: 36 borrows of a few ms each across 3
    // sessions should not average anywhere near the acquire budget
    let avg_wait = total_wait_ms.load(Ordering::Relaxed) / (WORKERS * ROUNDS) as u64;
    assert!(avg_wait < 1_000, "average acquire wait was {avg_wait}ms");

    pool.close().await;
    Ok(())
}

/// Waiters on an exhausted pool are woken in the order they arrived.
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn waiters_are_served_in_arrival_order() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new().max_sessions(1).open(factory).await?;

    let held = pool.acquire().await?;

    let order = Arc::new(AtomicU64::new(0));
    let mut waiters = Vec::new();
    for rank in 0..4u64 {
        let pool = pool.clone();
        let order = Arc::clone(&order);
        waiters.push(tokio::spawn(async move {
            let lease = pool
                .acquire_timeout(Duration::from_secs(10))
                .await
                .expect("waiter timed out");
            let woken = order.fetch_add(1, Ordering::SeqCst);
            lease.release().await;
            (rank, woken)
        }));
        // make the arrival order unambiguous
        sleep(Duration::from_millis(30)).await;
    }

    held.release().await;

    for waiter in waiters {
        let (rank, woken) = waiter.await.expect("waiter panicked");
        assert_eq!(rank, woken, "waiter {rank} was woken out of turn");
    }

    pool.close().await;
    Ok(())
}
