use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use super::inner::{Leased, PoolInner};
use super::slot::{BorrowerShared, Slot};
use crate::{Error, Result, factory::SessionFactory};

const RELEASED: &str = "BUG: lease already released";
const REVOKED: &str = "BUG: session taken while a guard was live";

/// A session borrowed from a [`Pool`][crate::Pool].
///
/// Will be returned to the pool on-drop; [`release`](PoolSession::release)
/// returns it eagerly instead of leaving the hand-back to a spawned task.
///
/// The raw session is reached through [`session`](PoolSession::session),
/// which yields a guard for the scope of one unit of work. Holding the
/// guard is what protects the session from being closed out from under a
/// borrower that the watcher has given up on.
pub struct PoolSession<F: SessionFactory> {
    slot: Option<Arc<Slot<F::Session>>>,
    borrower: Arc<BorrowerShared>,
    pool: Arc<PoolInner<F>>,
}

/// Exclusive access to the raw session for a scope of work.
pub struct SessionGuard<'a, S> {
    cell: tokio::sync::MutexGuard<'a, Option<S>>,
}

impl<F: SessionFactory> PoolSession<F> {
    pub(super) fn new(pool: Arc<PoolInner<F>>, leased: Leased<F::Session>) -> Self {
        Self {
            slot: Some(leased.slot),
            borrower: leased.borrower,
            pool,
        }
    }

    fn slot(&self) -> &Arc<Slot<F::Session>> {
        self.slot.as_ref().expect(RELEASED)
    }

    /// Lock the raw session for a unit of work.
    ///
    /// Fails with [`Error::SessionRevoked`] if the watcher or a pool
    /// shutdown already took the session out of this slot.
    pub async fn session(&self) -> Result<SessionGuard<'_, F::Session>> {
        let cell = self.slot().session.lock().await;
        if cell.is_none() {
            return Err(Error::SessionRevoked);
        }
        Ok(SessionGuard { cell })
    }

    /// Non-blocking variant of [`session`](PoolSession::session).
    pub fn try_session(&self) -> Option<SessionGuard<'_, F::Session>> {
        let cell = self.slot().session.try_lock().ok()?;
        cell.is_some().then(|| SessionGuard { cell })
    }

    /// Mark this session as not reusable; it will be closed when released.
    /// Idempotent.
    pub fn mark_dirty(&self) {
        self.slot().mark_dirty();
    }

    pub fn is_dirty(&self) -> bool {
        self.slot().is_dirty()
    }

    /// Handle for cooperating with the pool watcher; see [`Borrower`].
    pub fn borrower(&self) -> Borrower {
        Borrower {
            shared: Arc::clone(&self.borrower),
        }
    }

    pub(super) fn slot_id(&self) -> u64 {
        self.slot().id
    }

    /// Return the session to the pool now instead of from the drop task.
    pub async fn release(mut self) {
        if let Some(slot) = self.slot.take() {
            self.pool.release(slot).await;
        }
    }

    /// Close this session, letting the pool open a replacement on demand.
    pub async fn close(mut self) {
        if let Some(slot) = self.slot.take() {
            slot.mark_dirty();
            self.pool.release(slot).await;
        }
    }
}

impl<F: SessionFactory> Debug for PoolSession<F> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSession")
            .field("slot", &self.slot.as_ref().map(|slot| slot.id))
            .finish()
    }
}

/// Returns the session to the [`Pool`][crate::Pool] it was borrowed from.
impl<F: SessionFactory> Drop for PoolSession<F> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else { return };
        let pool = Arc::clone(&self.pool);

        // Without a runtime there is nowhere to run the release; the pool
        // observes the session as leaked, which is the best we can do.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { pool.release(slot).await });
        }
    }
}

impl<S> Deref for SessionGuard<'_, S> {
    type Target = S;

    fn deref(&self) -> &Self::Target {
        self.cell.as_ref().expect(REVOKED)
    }
}

impl<S> DerefMut for SessionGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.cell.as_mut().expect(REVOKED)
    }
}

/// The borrower's side of the watcher protocol.
///
/// The watcher cannot inspect a task the way the pool's lease accounting
/// would like, so cooperation is explicit: a borrower that wants to be
/// interruptible parks its long waits in [`do_until`](Borrower::do_until),
/// and a borrower that wants eviction to know when it is gone holds a
/// [`BorrowerGuard`] for the lifetime of its task.
#[derive(Clone)]
pub struct Borrower {
    shared: Arc<BorrowerShared>,
}

/// RAII token marking the borrower as alive; dropping it (normally, on
/// panic, or on task abort) marks the borrower terminated.
pub struct BorrowerGuard {
    shared: Arc<BorrowerShared>,
}

impl Borrower {
    /// Resolves when the watcher interrupts this lease; immediately if it
    /// already has.
    pub async fn interrupted(&self) {
        loop {
            if self.shared.is_interrupted() {
                return;
            }
            let listener = self.shared.listen();
            if self.shared.is_interrupted() {
                return;
            }
            listener.await;
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    /// Run `fut` until it completes or the watcher interrupts the lease.
    ///
    /// If the lease was already interrupted, `fut` is never polled.
    pub async fn do_until<Fut: Future>(&self, fut: Fut) -> Result<Fut::Output> {
        tokio::select! {
            biased;
            _ = self.interrupted() => Err(Error::Interrupted),
            out = fut => Ok(out),
        }
    }

    /// Create the liveness token for this borrow.
    pub fn guard(&self) -> BorrowerGuard {
        self.shared.attach();
        BorrowerGuard {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Drop for BorrowerGuard {
    fn drop(&mut self) {
        self.shared.terminate();
    }
}
