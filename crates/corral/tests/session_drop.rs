//! Lease drop behavior, including outside a runtime.

use std::time::Duration;

use corral::Corral;
use tokio::time::sleep;

mod support;
use support::TestFactory;

/// Dropping a lease (instead of releasing it eagerly) still returns the
/// session to the pool, just from a spawned task.
#[tokio::test]
async fn dropped_lease_returns_to_the_pool() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new().max_sessions(2).open(factory).await?;

    let lease = pool.acquire().await?;
    drop(lease);

    // the hand-back runs in a spawned task; give it a moment
    for _ in 0..50 {
        if pool.num_idle() == 1 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.num_idle(), 1);
    assert_eq!(pool.size(), 1);

    Ok(())
}

#[test]
fn lease_drop_without_runtime_does_not_panic() {
    let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let rt = tokio::runtime::Runtime::new().expect("tokio runtime");
        let (pool, lease) = rt.block_on(async {
            let pool = Corral::new()
                .max_sessions(1)
                .open(TestFactory::new())
                .await
                .expect("pool");
            let lease = pool.acquire().await.expect("lease");
            (pool, lease)
        });

        drop(rt);
        drop(lease);
        drop(pool);
    }));

    assert!(res.is_ok());
}

/// Dropping a lease after an eager release is a plain no-op.
#[tokio::test]
async fn release_consumes_the_lease() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let state = factory.state();
    let pool = Corral::new().max_sessions(1).open(factory).await?;

    let lease = pool.acquire().await?;
    lease.release().await;

    assert_eq!(pool.num_idle(), 1);
    assert_eq!(state.closed(), 0);

    pool.close().await;
    assert_eq!(state.closed(), 1);
    Ok(())
}
