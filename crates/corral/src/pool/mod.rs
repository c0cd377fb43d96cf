//! The session pool: acquire/release protocol, lifecycle, and the
//! background watcher.
//!
//! Opening a database session for each unit of work quickly becomes the
//! dominant cost of talking to the database. The pool amortizes it by
//! keeping a bounded set of live sessions and lending them out: callers
//! [`acquire`](Pool::acquire) a session, use it exclusively for a scope of
//! work, and release it by dropping the lease. Idle sessions are reused
//! most-recent-first while blocked acquirers are served oldest-first, so a
//! hot session stays hot and no waiter starves.
//!
//! Sessions are validated before they are lent out, and a background
//! watcher enforces the two time bounds: a borrower that holds a session
//! past its lease is warned about, then evicted so the pool can grow past
//! the lost session; a session that sits idle too long is pruned once the
//! pool is above its floor.

use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use event_listener::EventListener;
use futures_core::future::FusedFuture;
use futures_util::FutureExt;

use crate::{Corral, Error, Result, factory::SessionFactory};

mod idle;
mod inner;
mod session;
mod slot;
mod watcher;

use self::inner::PoolInner;
pub use self::session::{Borrower, BorrowerGuard, PoolSession, SessionGuard};

/// An asynchronous pool of database sessions.
///
/// Configure and open a pool with [`Corral`](crate::Corral), then call
/// [`acquire`](Pool::acquire) to borrow a session; dropping the returned
/// [`PoolSession`] returns it to the pool for reuse.
///
/// Acquisition is fair: tasks blocked on an exhausted pool are served
/// first-come, first-serve. Reuse is LIFO: the most recently released
/// session is lent out first, leaving the cold tail for the watcher to
/// prune once sessions outlive [`max_idle`](crate::Corral::max_idle).
///
/// `Pool` is `Send`, `Sync` and `Clone`; it is a reference-counted handle
/// to shared state, intended to be created once and shared across tasks.
/// Call [`close`](Pool::close) during shutdown to wake waiting acquirers
/// and close every session through the factory.
pub struct Pool<F: SessionFactory>(pub(crate) Arc<PoolInner<F>>);

impl<F: SessionFactory> Pool<F> {
    pub(crate) async fn new(options: Corral, factory: F) -> Result<Self> {
        let inner = PoolInner::new_arc(options, factory);
        inner.warm_up().await?;
        inner.install_watcher(watcher::spawn(&inner));
        Ok(Pool(inner))
    }

    /// Borrow a session, waiting at most the configured
    /// [`acquire_timeout`](crate::Corral::acquire_timeout).
    ///
    /// Prefers an idle session (validating it first and silently replacing
    /// it if validation fails); grows the pool when none is idle and the
    /// ceiling allows; otherwise waits for a release. Fails with
    /// [`Error::AcquireTimedOut`] when the budget runs out and
    /// [`Error::PoolClosed`] if the pool closes while waiting.
    pub async fn acquire(&self) -> Result<PoolSession<F>> {
        self.acquire_inner(self.0.options.acquire_timeout, self.0.options.max_lease)
            .await
    }

    /// [`acquire`](Pool::acquire) with a per-call time budget.
    pub async fn acquire_timeout(&self, budget: Duration) -> Result<PoolSession<F>> {
        self.acquire_inner(budget, self.0.options.max_lease).await
    }

    /// [`acquire`](Pool::acquire) with a per-call time budget and lease
    /// bound.
    ///
    /// The lease bound is enforced by the watcher, so it only has effect
    /// when the pool runs one (any configured time bound starts it).
    pub async fn acquire_with_lease(
        &self,
        budget: Duration,
        max_lease: Duration,
    ) -> Result<PoolSession<F>> {
        self.acquire_inner(budget, max_lease).await
    }

    async fn acquire_inner(&self, budget: Duration, max_lease: Duration) -> Result<PoolSession<F>> {
        let leased = self.0.acquire(budget, max_lease).await?;
        Ok(PoolSession::new(Arc::clone(&self.0), leased))
    }

    /// Borrow an idle session if one is free right now.
    ///
    /// Never waits, grows the pool, or validates the session. Returns
    /// `None` on an empty or closed pool, or when waiting tasks have
    /// already been promised the idle sessions. Must be called from within
    /// a runtime.
    pub fn try_acquire(&self) -> Option<PoolSession<F>> {
        if self.0.is_closed() {
            return None;
        }
        let slot = self.0.idle_try_take()?;

        if slot.is_dirty() {
            let pool = Arc::clone(&self.0);
            tokio::spawn(async move { pool.discard(slot, false).await });
            return None;
        }

        let leased = self.0.lease_slot(slot, self.0.options.max_lease);
        Some(PoolSession::new(Arc::clone(&self.0), leased))
    }

    /// Mark the borrowed session as not reusable; returns `false` when the
    /// session is no longer in the pool (it was evicted).
    pub fn mark_dirty(&self, session: &PoolSession<F>) -> bool {
        self.0.mark_dirty(session.slot_id())
    }

    /// Mark every pooled session dirty so each is replaced on its next
    /// release or acquire. Nothing is closed immediately, and concurrent
    /// acquires and releases continue normally.
    pub fn flush(&self) {
        self.0.flush();
    }

    /// Shut the pool down, immediately waking all tasks waiting for a
    /// session with [`Error::PoolClosed`].
    ///
    /// Stops the watcher, closes all idle sessions through the factory,
    /// and waits for borrowed sessions to be returned (each is closed on
    /// return rather than pooled). Idempotent, and safe to call from
    /// multiple handles concurrently.
    pub async fn close(&self) {
        self.0.close().await
    }

    /// Returns `true` once [`close`](Pool::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Get a future that resolves when the pool closes; see
    /// [`CloseEvent::do_until`] for bounding borrower work by it.
    pub fn close_event(&self) -> CloseEvent {
        CloseEvent {
            listener: (!self.is_closed()).then(|| self.0.on_closed_listener()),
        }
    }

    /// Number of open sessions, borrowed and idle together.
    pub fn size(&self) -> u32 {
        self.0.size()
    }

    /// Number of idle sessions waiting to be reused.
    pub fn num_idle(&self) -> usize {
        self.0.num_idle()
    }

    /// Number of sessions currently borrowed.
    pub fn num_used(&self) -> u32 {
        self.0.num_used()
    }

    /// Adjust the floor below which the watcher will not prune idle
    /// sessions. Lowering it lets the watcher shrink a quiet pool.
    pub fn set_min_sessions(&self, min: u32) {
        self.0.set_min_sessions(min);
    }

    /// Stop the background watcher without closing the pool.
    ///
    /// Lease and idle bounds are no longer enforced afterwards; the pool
    /// keeps serving sessions. [`close`](Pool::close) stops the watcher
    /// itself, so this is only needed to disable enforcement early.
    pub async fn stop_watcher(&self) {
        self.0.stop_watcher().await;
    }

    /// Point-in-time snapshot of the pool's gauges and lifetime counters.
    pub fn stats(&self) -> PoolStats {
        self.0.stats()
    }

    pub fn factory(&self) -> &F {
        &self.0.factory
    }

    pub fn options(&self) -> &Corral {
        &self.0.options
    }
}

/// Returns a new [`Pool`] handle tied to the same shared state.
impl<F: SessionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<F: SessionFactory> fmt::Debug for Pool<F> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Pool")
            .field("factory", &self.0.factory.describe())
            .field("size", &self.0.size())
            .field("num_idle", &self.0.num_idle())
            .field("is_closed", &self.0.is_closed())
            .finish()
    }
}

/// Point-in-time pool statistics.
///
/// `open`, `idle` and `used` are gauges; the rest are monotonic totals
/// since the pool was opened.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolStats {
    pub open: u32,
    pub idle: usize,
    pub used: u32,
    /// Sessions opened through the factory.
    pub created: u64,
    /// Sessions discarded because validation failed.
    pub invalid: u64,
    /// Lease expirations that ended in a warning rather than an eviction.
    pub expired: u64,
    /// Sessions pruned for sitting idle too long.
    pub idled: u64,
    /// Sessions evicted from hanging borrowers.
    pub evicted: u64,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "open={} idle={} used={} created={} invalid={} expired={} idled={} evicted={}",
            self.open,
            self.idle,
            self.used,
            self.created,
            self.invalid,
            self.expired,
            self.idled,
            self.evicted
        )
    }
}

/// A future that resolves when the pool is closed.
///
/// See [`Pool::close_event`].
pub struct CloseEvent {
    listener: Option<EventListener>,
}

impl CloseEvent {
    /// Run `fut` until it completes or the pool closes.
    ///
    /// Returns `Err(PoolClosed)` if the pool closes first; if it was
    /// already closed, `fut` is never polled. Useful for long-running
    /// borrower work that must not hold up [`Pool::close`].
    pub async fn do_until<Fut: Future>(&mut self, fut: Fut) -> Result<Fut::Output> {
        tokio::select! {
            biased;
            _ = &mut *self => Err(Error::PoolClosed),
            out = fut => Ok(out),
        }
    }
}

impl Future for CloseEvent {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(listener) = &mut self.listener {
            futures_core::ready!(listener.poll_unpin(cx));
        }

        // Dropping the listener fuses the future: a `CloseEvent` that has
        // fired once stays ready instead of re-arming on the next event.
        self.listener = None;

        Poll::Ready(())
    }
}

impl FusedFuture for CloseEvent {
    fn is_terminated(&self) -> bool {
        self.listener.is_none()
    }
}

#[test]
#[allow(dead_code)]
fn assert_pool_traits() {
    fn assert_send_sync<T: Send + Sync>() {}
    fn assert_clone<T: Clone>() {}

    fn assert_pool<F: SessionFactory>() {
        assert_send_sync::<Pool<F>>();
        assert_clone::<Pool<F>>();
        assert_send_sync::<PoolSession<F>>();
    }

    fn assert_handles() {
        assert_send_sync::<Borrower>();
        assert_clone::<Borrower>();
        assert_send_sync::<BorrowerGuard>();
    }
}
