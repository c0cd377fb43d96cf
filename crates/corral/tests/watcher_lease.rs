use std::time::Duration;

use corral::{Corral, Error};
use tokio::time::sleep;

mod support;
use support::TestFactory;

/// An overheld lease draws a warning and poisons the session, but with
/// eviction disabled the entry survives until the borrower returns it.
#[tokio::test]
async fn expired_lease_marks_the_session_dirty() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let state = factory.state();
    let pool = Corral::new()
        .max_sessions(3)
        .max_lease(Duration::from_millis(300))
        .max_idle(Duration::ZERO)
        .scan_interval(Duration::from_millis(10))
        .evict_threshold(0)
        .open(factory)
        .await?;

    let lease = pool.acquire().await?;
    sleep(Duration::from_millis(500)).await;

    let stats = pool.stats();
    assert!(stats.expired >= 1, "no expiry recorded: {stats}");
    assert_eq!(stats.evicted, 0);
    assert!(lease.is_dirty());
    assert_eq!(pool.size(), 1);

    lease.release().await;
    assert_eq!(pool.size(), 0);
    assert_eq!(state.closed(), 1);

    Ok(())
}

/// Between warnings the wait clock restarts, so a lease twice over its
/// bound is reported once per period, not once per scan.
#[tokio::test]
async fn expiry_warnings_are_paced_by_the_lease_period() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new()
        .max_sessions(1)
        .max_lease(Duration::from_millis(200))
        .max_idle(Duration::ZERO)
        .scan_interval(Duration::from_millis(10))
        .evict_threshold(0)
        .open(factory)
        .await?;

    let lease = pool.acquire().await?;
    sleep(Duration::from_millis(500)).await;
    lease.release().await;

    let expired = pool.stats().expired;
    // ~500ms over a 200ms lease: two expiries, three at the margins; a
    // scan-frequency bug would push this over 20
    assert!((1..=4).contains(&expired), "expired {expired} times");

    Ok(())
}

/// A lease bound chosen at acquire time overrides the configured default.
#[tokio::test]
async fn per_acquire_lease_bound_applies() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new()
        .max_sessions(2)
        .max_lease(Duration::from_secs(60))
        .max_idle(Duration::ZERO)
        .scan_interval(Duration::from_millis(10))
        .evict_threshold(0)
        .open(factory)
        .await?;

    let short = pool
        .acquire_with_lease(Duration::from_secs(5), Duration::from_millis(100))
        .await?;
    let long = pool.acquire().await?;
    sleep(Duration::from_millis(300)).await;

    assert!(short.is_dirty());
    assert!(!long.is_dirty());

    short.release().await;
    long.release().await;
    Ok(())
}

/// With interruption enabled the watcher wakes a borrower parked in
/// `do_until` instead of waiting for it to notice on its own.
#[tokio::test]
async fn watcher_interrupts_a_parked_borrower() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let state = factory.state();
    let pool = Corral::new()
        .max_sessions(1)
        .max_lease(Duration::from_millis(100))
        .max_idle(Duration::ZERO)
        .scan_interval(Duration::from_millis(10))
        .evict_threshold(0)
        .interrupt_borrower(true)
        .open(factory)
        .await?;

    let lease = pool.acquire().await?;
    let borrower = lease.borrower();

    let res = tokio::time::timeout(
        Duration::from_secs(5),
        borrower.do_until(sleep(Duration::from_secs(60))),
    )
    .await
    .expect("watcher never interrupted the borrower");
    assert!(matches!(res, Err(Error::Interrupted)));
    assert!(borrower.is_interrupted());

    // interrupted means: wind down and give the session back
    lease.release().await;
    assert_eq!(pool.size(), 0);
    assert_eq!(state.closed(), 1);

    Ok(())
}

/// Once the watcher is stopped, lease bounds are no longer enforced.
#[tokio::test]
async fn stopping_the_watcher_disables_enforcement() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new()
        .max_sessions(1)
        .max_lease(Duration::from_millis(50))
        .max_idle(Duration::ZERO)
        .scan_interval(Duration::from_millis(10))
        .evict_threshold(0)
        .open(factory)
        .await?;

    pool.stop_watcher().await;

    let lease = pool.acquire().await?;
    sleep(Duration::from_millis(200)).await;

    assert_eq!(pool.stats().expired, 0);
    assert!(!lease.is_dirty());
    lease.release().await;
    assert_eq!(pool.num_idle(), 1);

    Ok(())
}

/// Without the watcher in play, `do_until` passes work through.
#[tokio::test]
async fn do_until_completes_undisturbed_work() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new().max_sessions(1).open(factory).await?;

    let lease = pool.acquire().await?;
    let out = lease.borrower().do_until(async { 7 }).await?;
    assert_eq!(out, 7);

    lease.release().await;
    Ok(())
}
