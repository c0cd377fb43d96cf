use std::future::Future;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use event_listener::Event;
use tokio::time::timeout;

use super::slot::{BorrowerShared, Slot};
use super::watcher::WatcherHandle;
use super::{
    PoolStats,
    idle::{IdleQueue, Steal},
};
use crate::{Corral, Error, Result, factory::SessionFactory};

const POISONED: &str = "BUG: watcher handle mutex poisoned";

/// How long an acquire probes the idle queue before considering growth.
///
/// Long enough that a burst of acquires reuses sessions released moments
/// ago instead of opening new ones; short enough that the first caller on
/// an empty pool is not delayed noticeably.
const BURST_PROBE: Duration = Duration::from_millis(1);

/// A slot freshly transitioned to leased, together with the borrower
/// handle created for this lease.
pub(super) struct Leased<S> {
    pub(super) slot: Arc<Slot<S>>,
    pub(super) borrower: Arc<BorrowerShared>,
}

/// Shared pool state: the registry of all open sessions, the idle queue,
/// and the lifecycle counters.
pub(crate) struct PoolInner<F: SessionFactory> {
    pub(super) factory: F,
    pub(super) options: Corral,
    /// All open sessions, borrowed and idle alike, keyed by slot id.
    /// Reads (release checks, watcher scans) never contend with the
    /// single-writer inserts and removes.
    registry: DashMap<u64, Arc<Slot<F::Session>>>,
    idle: IdleQueue<F::Session>,
    /// Serializes growth so sessions are opened one at a time. Deliberate:
    /// a burst of acquires must not storm the database with simultaneous
    /// opens, at the price of a small serialized wait per caller.
    grow: tokio::sync::Mutex<()>,
    /// Authoritative size bound, checked again under the growth lock. May
    /// lag registry cardinality by at most one update.
    open: AtomicU32,
    min_sessions: AtomicU32,
    next_slot_id: AtomicU64,
    next_lease_seq: AtomicU64,
    is_closed: AtomicBool,
    on_closed: Event,
    /// Fired on every open-count decrement; `close()` waits on it for the
    /// last borrowed sessions to come home.
    on_released: Event,
    epoch: Instant,
    pub(super) counters: Counters,
    watcher: Mutex<Option<WatcherHandle>>,
}

/// Monotonic totals, for observability only.
#[derive(Default)]
pub(super) struct Counters {
    pub(super) created: AtomicU64,
    pub(super) invalid: AtomicU64,
    pub(super) expired: AtomicU64,
    pub(super) idled: AtomicU64,
    pub(super) evicted: AtomicU64,
}

impl<F: SessionFactory> PoolInner<F> {
    pub(super) fn new_arc(options: Corral, factory: F) -> Arc<Self> {
        tracing::debug!(
            factory = %factory.describe(),
            max_sessions = options.max_sessions,
            min_sessions = options.min_sessions,
            "creating session pool"
        );
        Arc::new(Self {
            factory,
            registry: DashMap::new(),
            idle: IdleQueue::new(),
            grow: tokio::sync::Mutex::new(()),
            open: AtomicU32::new(0),
            min_sessions: AtomicU32::new(options.min_sessions),
            next_slot_id: AtomicU64::new(1),
            next_lease_seq: AtomicU64::new(1),
            is_closed: AtomicBool::new(false),
            on_closed: Event::new(),
            on_released: Event::new(),
            epoch: Instant::now(),
            counters: Counters::default(),
            watcher: Mutex::new(None),
            options,
        })
    }

    pub(super) fn size(&self) -> u32 {
        self.open.load(Ordering::Acquire)
    }

    pub(super) fn num_idle(&self) -> usize {
        self.idle.len()
    }

    pub(super) fn num_used(&self) -> u32 {
        self.size().saturating_sub(self.num_idle() as u32)
    }

    pub(super) fn min_sessions(&self) -> u32 {
        self.min_sessions.load(Ordering::Acquire)
    }

    pub(super) fn set_min_sessions(&self, min: u32) {
        self.min_sessions.store(min, Ordering::Release);
    }

    pub(super) fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub(super) fn stats(&self) -> PoolStats {
        PoolStats {
            open: self.size(),
            idle: self.num_idle(),
            used: self.num_used(),
            created: self.counters.created.load(Ordering::Relaxed),
            invalid: self.counters.invalid.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            idled: self.counters.idled.load(Ordering::Relaxed),
            evicted: self.counters.evicted.load(Ordering::Relaxed),
        }
    }

    pub(super) fn on_closed_listener(&self) -> event_listener::EventListener {
        self.on_closed.listen()
    }

    /// Future that resolves when the pool closes; resolves immediately if
    /// it already has.
    pub(super) fn close_event(&self) -> impl Future<Output = ()> + '_ {
        let listener = (!self.is_closed()).then(|| self.on_closed.listen());

        async move {
            if let Some(listener) = listener {
                listener.await;
            }
        }
    }

    pub(super) fn install_watcher(&self, handle: Option<WatcherHandle>) {
        *self.watcher.lock().expect(POISONED) = handle;
    }

    fn next_lease_seq(&self) -> u64 {
        self.next_lease_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Transition an idle slot to leased with the given bound.
    pub(super) fn lease_slot(&self, slot: Arc<Slot<F::Session>>, max_lease: Duration) -> Leased<F::Session> {
        let borrower = slot.mark_leased(self.next_lease_seq(), max_lease);
        Leased { slot, borrower }
    }

    /// Acquire a session, bounded by `budget` wall time.
    pub(super) async fn acquire(
        self: &Arc<Self>,
        budget: Duration,
        max_lease: Duration,
    ) -> Result<Leased<F::Session>> {
        if self.is_closed() {
            return Err(Error::PoolClosed);
        }

        timeout(budget, self.acquire_inner(max_lease))
            .await
            .map_err(|_| Error::AcquireTimedOut)?
    }

    async fn acquire_inner(self: &Arc<Self>, max_lease: Duration) -> Result<Leased<F::Session>> {
        loop {
            if self.is_closed() {
                return Err(Error::PoolClosed);
            }

            // Warmup fast path: below the floor, grow without consulting
            // the idle queue and hand the new session straight out.
            if self.size() < self.min_sessions() {
                if let Some(leased) = self.try_grow(max_lease).await? {
                    return Ok(leased);
                }
            }

            // Probe briefly for a just-released session before paying for
            // a new one, then wait out the remaining budget.
            let mut slot = self.idle.take_slot(BURST_PROBE).await;

            if slot.is_none() && self.size() < self.options.max_sessions {
                if let Some(leased) = self.try_grow(max_lease).await? {
                    return Ok(leased);
                }
            }

            if slot.is_none() {
                slot = tokio::select! {
                    slot = self.idle.wait_slot() => slot,
                    _ = self.close_event() => return Err(Error::PoolClosed),
                };
            }

            let Some(slot) = slot else {
                // only possible while the pool is shutting down
                continue;
            };

            if !slot.is_dirty() {
                if let Err(err) = self.validate_slot(&slot).await {
                    tracing::info!(slot = slot.id, "discarding session that failed validation: {err}");
                    slot.mark_dirty();
                    self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                }
            }

            if slot.is_dirty() {
                self.discard(slot, false).await;
                continue;
            }

            return Ok(self.lease_slot(slot, max_lease));
        }
    }

    async fn validate_slot(&self, slot: &Arc<Slot<F::Session>>) -> Result<()> {
        // idle slots are uncontended; a missing session means the slot was
        // torn down underneath us
        let mut cell = slot
            .session
            .try_lock()
            .map_err(|_| Error::SessionRevoked)?;
        match cell.as_mut() {
            Some(session) => self.factory.validate(session).await,
            None => Err(Error::SessionRevoked),
        }
    }

    /// Open a new session if the pool is still below its ceiling.
    ///
    /// The factory call happens inside the growth lock: creation is
    /// serialized by design.
    async fn try_grow(self: &Arc<Self>, max_lease: Duration) -> Result<Option<Leased<F::Session>>> {
        let _guard = self.grow.lock().await;

        if self.is_closed() {
            return Err(Error::PoolClosed);
        }
        // double-checked under the lock
        if self.size() >= self.options.max_sessions {
            return Ok(None);
        }

        let session = self.factory.open().await?;

        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, session, self.epoch));
        let leased = self.lease_slot(Arc::clone(&slot), max_lease);
        self.registry.insert(id, slot);
        self.open.fetch_add(1, Ordering::AcqRel);
        self.counters.created.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(slot = id, open = self.size(), "opened new session");
        Ok(Some(leased))
    }

    /// Return a borrowed session to the pool.
    ///
    /// Runs from the lease wrapper's drop (via a spawned task) or from an
    /// eager release call.
    pub(super) async fn release(self: &Arc<Self>, slot: Arc<Slot<F::Session>>) {
        let registered = self.registry.contains_key(&slot.id);
        if !registered {
            // evicted while borrowed; the open count was already deducted
            // at eviction, so only the raw session remains to clean up
            tracing::warn!(slot = slot.id, "released session is not in the pool; closing it");
            if let Some(session) = slot.take_session() {
                self.factory.close(session, true).await;
            }
            return;
        }

        if !slot.is_leased() {
            tracing::warn!(slot = slot.id, "session released twice");
            return;
        }

        slot.mark_released();

        if self.is_closed() || slot.is_dirty() {
            self.discard(slot, true).await;
            return;
        }

        self.idle.return_slot(slot);
    }

    /// Remove a slot from the pool and close its session.
    ///
    /// Safe against racing with eviction: the open count is only
    /// decremented if this call is the one that removed the registry
    /// entry, and the session cell guarantees exactly-once closing.
    pub(super) async fn discard(&self, slot: Arc<Slot<F::Session>>, rollback: bool) {
        let removed = self.deregister(slot.id);
        if let Some(session) = slot.take_session() {
            self.factory.close(session, rollback).await;
        }
        if removed {
            self.decrement_open();
        }
        tracing::debug!(slot = slot.id, open = self.size(), "discarded session");
    }

    pub(super) fn deregister(&self, id: u64) -> bool {
        self.registry.remove(&id).is_some()
    }

    pub(super) fn decrement_open(&self) {
        self.open.fetch_sub(1, Ordering::AcqRel);
        self.on_released.notify(usize::MAX);
    }

    pub(super) fn registry_snapshot(&self) -> Vec<Arc<Slot<F::Session>>> {
        self.registry
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect()
    }

    /// Mark the identified slot dirty; `false` if it is no longer pooled.
    pub(super) fn mark_dirty(&self, id: u64) -> bool {
        match self.registry.get(&id) {
            Some(slot) => {
                slot.mark_dirty();
                true
            }
            None => false,
        }
    }

    /// Mark every pooled session dirty. Nothing is closed here; dirty
    /// sessions are torn down on release or on the acquire validation
    /// path, so concurrent acquires and releases continue undisturbed.
    pub(super) fn flush(&self) {
        for slot in self.registry.iter() {
            slot.mark_dirty();
        }
        tracing::debug!(count = self.registry.len(), "flushed pool");
    }

    pub(super) fn idle_try_take(&self) -> Option<Arc<Slot<F::Session>>> {
        self.idle.try_take_slot()
    }

    pub(super) fn idle_peek_oldest(&self) -> Option<(u64, Duration)> {
        self.idle.peek_oldest()
    }

    pub(super) fn idle_steal(&self, expected_id: u64) -> Steal<F::Session> {
        self.idle.steal_oldest(expected_id)
    }

    /// Open `min_sessions` sessions ahead of demand by cycling
    /// acquire/release: each round trips the warmup fast path, so every
    /// iteration opens a fresh session.
    pub(super) async fn warm_up(self: &Arc<Self>) -> Result<()> {
        let min = self.min_sessions().min(self.options.max_sessions);
        for opened in 0..min {
            match self.acquire(self.options.acquire_timeout, self.options.max_lease).await {
                Ok(leased) => self.release(leased.slot).await,
                Err(err) => {
                    if self.options.fail_fast {
                        self.abort_warmup().await;
                        return Err(err);
                    }
                    tracing::warn!(
                        opened,
                        wanted = min,
                        "pool warmup stopped early; continuing with fewer sessions: {err}"
                    );
                    break;
                }
            }
        }
        Ok(())
    }

    /// Tear down everything created by a failed fail-fast warmup.
    async fn abort_warmup(self: &Arc<Self>) {
        self.is_closed.store(true, Ordering::Release);
        self.on_closed.notify(usize::MAX);
        for slot in self.idle.drain() {
            self.discard(slot, false).await;
        }
    }

    /// Stop the background watcher, waiting for its task to exit. No-op
    /// if it never ran or was already stopped.
    pub(super) async fn stop_watcher(&self) {
        let watcher = self.watcher.lock().expect(POISONED).take();
        if let Some(watcher) = watcher {
            watcher.stop().await;
        }
    }

    /// Close the pool: terminal and idempotent.
    ///
    /// Stops the watcher, closes idle sessions, revokes borrowed sessions
    /// that are not actively inside a guard, and waits for the rest to be
    /// released (their release closes them since the pool is now closed).
    pub(super) async fn close(self: &Arc<Self>) {
        self.is_closed.store(true, Ordering::Release);
        self.on_closed.notify(usize::MAX);

        self.stop_watcher().await;

        loop {
            for slot in self.idle.drain() {
                self.discard(slot, false).await;
            }

            // Borrowed sessions: take the ones nobody is actively using.
            for slot in self.registry_snapshot() {
                if let Some(session) = slot.take_session() {
                    let removed = self.deregister(slot.id);
                    self.factory.close(session, true).await;
                    if removed {
                        self.decrement_open();
                    }
                }
            }

            if self.size() == 0 {
                break;
            }
            let listener = self.on_released.listen();
            if self.size() == 0 {
                break;
            }
            listener.await;
        }

        tracing::debug!(factory = %self.factory.describe(), "pool closed");
    }
}

impl<F: SessionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.is_closed.store(true, Ordering::Release);
        self.on_closed.notify(usize::MAX);
    }
}
