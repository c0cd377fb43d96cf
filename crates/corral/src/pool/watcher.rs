use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

use event_listener::Event;
use tokio::task::JoinHandle;

use super::idle::Steal;
use super::inner::PoolInner;
use super::slot::{BorrowerSnapshot, Slot};
use crate::factory::SessionFactory;

/// Owner-side handle to the background watcher task.
pub(crate) struct WatcherHandle {
    stop: Arc<StopSignal>,
    task: JoinHandle<()>,
}

struct StopSignal {
    stopped: AtomicBool,
    event: Event,
}

impl WatcherHandle {
    /// Wake the watcher out of its scan-interval sleep and wait for it to
    /// exit.
    pub(super) async fn stop(self) {
        self.stop.stopped.store(true, Ordering::Release);
        self.stop.event.notify(usize::MAX);
        if let Err(err) = self.task.await {
            // the pool kept serving without it; just surface that the
            // watcher died before it was stopped
            tracing::error!("pool watcher terminated abnormally: {err}");
        }
    }
}

/// Start the periodic scan task if any time bound is configured.
///
/// The watcher holds only a weak reference back to the pool: it exits on
/// its own once the last pool handle is gone.
pub(super) fn spawn<F: SessionFactory>(pool: &Arc<PoolInner<F>>) -> Option<WatcherHandle> {
    if !pool.options.watcher_enabled() {
        return None;
    }

    let stop = Arc::new(StopSignal {
        stopped: AtomicBool::new(false),
        event: Event::new(),
    });
    let task = tokio::spawn(run(Arc::downgrade(pool), Arc::clone(&stop)));

    tracing::debug!(
        max_lease_ms = pool.options.max_lease.as_millis() as u64,
        max_idle_ms = pool.options.max_idle.as_millis() as u64,
        scan_interval_ms = pool.options.scan_interval.as_millis() as u64,
        "started pool watcher"
    );
    Some(WatcherHandle { stop, task })
}

async fn run<F: SessionFactory>(weak: Weak<PoolInner<F>>, stop: Arc<StopSignal>) {
    loop {
        let interval;
        {
            let Some(pool) = weak.upgrade() else { return };
            if pool.is_closed() || stop.stopped.load(Ordering::Acquire) {
                return;
            }

            scan_leases(&pool).await;
            scan_idle(&pool).await;

            interval = pool.options.scan_interval;
        }

        // sleep without keeping the pool alive; stop() cuts the sleep short
        let listener = stop.event.listen();
        if stop.stopped.load(Ordering::Acquire) {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = listener => return,
        }
    }
}

/// Warn about, and eventually evict, sessions whose borrowers have held
/// them past their lease bound.
async fn scan_leases<F: SessionFactory>(pool: &Arc<PoolInner<F>>) {
    for slot in pool.registry_snapshot() {
        if !slot.is_leased() {
            continue;
        }
        let bound = slot.max_lease();
        if bound.is_zero() || slot.wait_elapsed() < bound {
            continue;
        }

        let Some(borrower) = slot.borrower_snapshot() else {
            continue;
        };
        // the session may have been returned while the borrower was being
        // captured; never act on a lease that is already over
        if !slot.is_leased() {
            continue;
        }

        slot.mark_dirty();
        let expirations = slot.bump_expired();

        let terminated = borrower.shared.is_terminated();
        let mut interrupted = false;
        if !terminated && pool.options.interrupt_borrower {
            borrower.shared.fire_interrupt();
            interrupted = true;
        }

        let threshold = pool.options.evict_threshold;
        if threshold > 0 && (terminated || expirations >= threshold) {
            evict(pool, &slot, &borrower, terminated, interrupted).await;
            continue;
        }

        pool.counters.expired.fetch_add(1, Ordering::Relaxed);
        // restart the clock so the next warning fires one full lease
        // period from now, not on every scan
        slot.reset_wait_start();
        tracing::warn!(
            slot = slot.id,
            lease = borrower.seq,
            held_ms = borrower.held_for.as_millis() as u64,
            expirations,
            interrupted,
            "lease expired; session is marked dirty and will not be reused"
        );
    }
}

/// Remove a lost session from the pool so fresh work can grow past it.
///
/// Without eviction a hanging borrower would pin the open count at the
/// ceiling and starve every other caller.
async fn evict<F: SessionFactory>(
    pool: &Arc<PoolInner<F>>,
    slot: &Arc<Slot<F::Session>>,
    borrower: &BorrowerSnapshot,
    terminated: bool,
    interrupted: bool,
) {
    pool.counters.evicted.fetch_add(1, Ordering::Relaxed);
    if pool.deregister(slot.id) {
        pool.decrement_open();
    }

    let close = (pool.options.close_evicted && !pool.options.close_evicted_when_terminated)
        || (pool.options.close_evicted_when_terminated && terminated);

    let mut closed = false;
    if close {
        // only succeeds when no guard is held; an active borrower keeps
        // the session and surrenders it on its eventual release
        if let Some(session) = slot.take_session() {
            pool.factory.close(session, true).await;
            closed = true;
        }
    }

    tracing::warn!(
        slot = slot.id,
        lease = borrower.seq,
        held_ms = borrower.held_for.as_millis() as u64,
        terminated,
        interrupted,
        closed,
        "evicted session whose borrower failed to return it"
    );
}

/// Prune sessions that have sat unused at the cold end of the idle queue,
/// down to the configured floor.
///
/// Releases push to the front of the idle queue, so the tail is always the
/// oldest idle session.
async fn scan_idle<F: SessionFactory>(pool: &Arc<PoolInner<F>>) {
    if pool.options.max_idle.is_zero() {
        return;
    }

    while pool.size() > pool.min_sessions() {
        let Some((oldest, idle_for)) = pool.idle_peek_oldest() else {
            return;
        };
        if idle_for < pool.options.max_idle {
            return;
        }

        match pool.idle_steal(oldest) {
            Steal::Taken(slot) => {
                let removed = pool.deregister(slot.id);
                if let Some(session) = slot.take_session() {
                    pool.factory.close(session, false).await;
                }
                if removed {
                    pool.decrement_open();
                }
                pool.counters.idled.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    slot = slot.id,
                    idle_ms = idle_for.as_millis() as u64,
                    "pruned idle session"
                );
            }
            // a burst of traffic claimed the tail first; come back next
            // cycle rather than fight over it
            Steal::Busy | Steal::Changed => return,
        }
    }
}
