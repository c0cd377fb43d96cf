use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

use event_listener::{Event, EventListener};

const POISONED: &str = "BUG: slot borrower mutex poisoned";

/// Per-session bookkeeping: one slot per live session, registered in the
/// pool for as long as the session is open.
///
/// The raw session always lives inside its slot; borrowers reach it through
/// [`SessionGuard`](crate::SessionGuard) and the watcher takes it out with
/// [`take_session`](Slot::take_session) when a slot is torn down. The state
/// flags are plain atomics so the watcher can observe them without locks;
/// an entry may flip `leased → released → leased` during a scan, which the
/// watcher guards against by re-checking [`is_leased`](Slot::is_leased)
/// after capturing the borrower.
pub(crate) struct Slot<S> {
    pub(super) id: u64,
    pub(super) session: tokio::sync::Mutex<Option<S>>,
    epoch: Instant,
    leased: AtomicBool,
    dirty: AtomicBool,
    /// Millis since the pool epoch; marks "lease began" while leased and
    /// "became idle" while idle.
    wait_start_ms: AtomicU64,
    max_lease_ms: AtomicU64,
    expired_count: AtomicU32,
    borrower: Mutex<Option<BorrowerInfo>>,
}

impl<S> Slot<S> {
    pub(super) fn new(id: u64, session: S, epoch: Instant) -> Self {
        Self {
            id,
            session: tokio::sync::Mutex::new(Some(session)),
            epoch,
            leased: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
            wait_start_ms: AtomicU64::new(epoch.elapsed().as_millis() as u64),
            max_lease_ms: AtomicU64::new(0),
            expired_count: AtomicU32::new(0),
            borrower: Mutex::new(None),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Transition to leased, recording the borrower and the lease bound.
    ///
    /// Returns the borrower handle shared with the lease wrapper.
    pub(super) fn mark_leased(&self, seq: u64, max_lease: Duration) -> Arc<BorrowerShared> {
        let shared = Arc::new(BorrowerShared::new());
        *self.borrower.lock().expect(POISONED) = Some(BorrowerInfo {
            seq,
            since: Instant::now(),
            shared: Arc::clone(&shared),
        });
        self.max_lease_ms
            .store(max_lease.as_millis() as u64, Ordering::Release);
        self.expired_count.store(0, Ordering::Release);
        self.reset_wait_start();
        self.leased.store(true, Ordering::Release);
        shared
    }

    /// Clear the borrower and transition back to idle.
    pub(super) fn mark_released(&self) {
        *self.borrower.lock().expect(POISONED) = None;
        self.leased.store(false, Ordering::Release);
        self.reset_wait_start();
    }

    /// Once dirty, always dirty: the slot is torn down on the next release
    /// or on the acquire validation path.
    pub(super) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub(super) fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(super) fn is_leased(&self) -> bool {
        self.leased.load(Ordering::Acquire)
    }

    pub(super) fn max_lease(&self) -> Duration {
        Duration::from_millis(self.max_lease_ms.load(Ordering::Acquire))
    }

    /// Time since the last lease/release transition (or the last watcher
    /// warning, see [`reset_wait_start`](Slot::reset_wait_start)).
    pub(super) fn wait_elapsed(&self) -> Duration {
        let start = self.wait_start_ms.load(Ordering::Acquire);
        Duration::from_millis(self.now_ms().saturating_sub(start))
    }

    /// Restart the wait clock. The watcher calls this after warning about
    /// an expired lease so the next warning fires one full lease period
    /// later instead of on every scan.
    pub(super) fn reset_wait_start(&self) {
        self.wait_start_ms.store(self.now_ms(), Ordering::Release);
    }

    /// Record one more consecutive lease expiry; returns the new count.
    pub(super) fn bump_expired(&self) -> u32 {
        self.expired_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Take the raw session out of the slot, if no one is using it.
    ///
    /// Returns `None` when the session was already taken or a borrower is
    /// inside a `SessionGuard` right now.
    pub(super) fn take_session(&self) -> Option<S> {
        self.session.try_lock().ok().and_then(|mut cell| cell.take())
    }

    pub(super) fn borrower_snapshot(&self) -> Option<BorrowerSnapshot> {
        self.borrower
            .lock()
            .expect(POISONED)
            .as_ref()
            .map(|info| BorrowerSnapshot {
                seq: info.seq,
                held_for: info.since.elapsed(),
                shared: Arc::clone(&info.shared),
            })
    }
}

struct BorrowerInfo {
    /// Pool-wide lease sequence number; identifies the borrow in logs.
    seq: u64,
    since: Instant,
    shared: Arc<BorrowerShared>,
}

/// The provenance the watcher logs in place of a stack snapshot: which
/// lease, for how long, and what state its borrower is in.
pub(super) struct BorrowerSnapshot {
    pub(super) seq: u64,
    pub(super) held_for: Duration,
    pub(super) shared: Arc<BorrowerShared>,
}

/// State shared between a lease and the handles the borrower took from it.
///
/// Interruption is advisory: the watcher fires the event, and a borrower
/// parked in [`Borrower::do_until`](crate::Borrower::do_until) wakes with
/// an error. Termination is explicit: the borrower holds a
/// [`BorrowerGuard`](crate::BorrowerGuard) whose drop marks the borrower
/// as gone even if the lease itself was leaked.
pub(crate) struct BorrowerShared {
    interrupt: Event,
    interrupted: AtomicBool,
    attached: AtomicBool,
    terminated: AtomicBool,
}

impl BorrowerShared {
    fn new() -> Self {
        Self {
            interrupt: Event::new(),
            interrupted: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
        }
    }

    pub(crate) fn fire_interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.interrupt.notify(usize::MAX);
    }

    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn listen(&self) -> EventListener {
        self.interrupt.listen()
    }

    /// Called when the borrower takes a guard; termination is only
    /// meaningful once a guard existed.
    pub(crate) fn attach(&self) {
        self.attached.store(true, Ordering::Release);
    }

    pub(crate) fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.attached.load(Ordering::Acquire) && self.terminated.load(Ordering::Acquire)
    }
}
