use std::time::Duration;

use corral::Corral;
use tokio::time::sleep;

mod support;
use support::TestFactory;

/// Lowering the session floor lets the watcher prune the cold tail of the
/// idle queue down to the new floor.
#[tokio::test]
async fn idle_sessions_are_pruned_to_the_floor() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let state = factory.state();
    let pool = Corral::new()
        .min_sessions(3)
        .max_sessions(5)
        .max_lease(Duration::ZERO)
        .max_idle(Duration::from_millis(100))
        .scan_interval(Duration::from_millis(50))
        .open(factory)
        .await?;

    assert_eq!(pool.size(), 3);
    pool.set_min_sessions(1);

    sleep(Duration::from_millis(400)).await;

    let stats = pool.stats();
    assert_eq!(stats.idled, 2, "{stats}");
    assert_eq!(pool.size(), 1);
    assert_eq!(pool.num_idle(), 1);
    assert_eq!(state.closed(), 2);

    Ok(())
}

/// At the floor nothing is pruned no matter how stale the tail gets.
#[tokio::test]
async fn the_floor_is_never_pruned() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let state = factory.state();
    let pool = Corral::new()
        .min_sessions(2)
        .max_sessions(4)
        .max_lease(Duration::ZERO)
        .max_idle(Duration::from_millis(50))
        .scan_interval(Duration::from_millis(25))
        .open(factory)
        .await?;

    sleep(Duration::from_millis(300)).await;

    assert_eq!(pool.stats().idled, 0);
    assert_eq!(pool.size(), 2);
    assert_eq!(state.closed(), 0);

    Ok(())
}

/// A session kept busy never idles long enough to be pruned, while an
/// untouched sibling does.
#[tokio::test]
async fn active_sessions_survive_the_prune() -> anyhow::Result<()> {
    let factory = TestFactory::new();
    let pool = Corral::new()
        .min_sessions(2)
        .max_sessions(4)
        .max_lease(Duration::ZERO)
        .max_idle(Duration::from_millis(150))
        .scan_interval(Duration::from_millis(25))
        .open(factory)
        .await?;

    pool.set_min_sessions(0);

    // keep cycling one session; the other goes stale at the tail
    for _ in 0..10 {
        let lease = pool.acquire().await?;
        sleep(Duration::from_millis(40)).await;
        lease.release().await;
    }

    assert_eq!(pool.stats().idled, 1);
    assert_eq!(pool.size(), 1);

    pool.close().await;
    Ok(())
}
