use std::time::Duration;

use crate::{Result, factory::SessionFactory, pool::Pool};

/// Configure and open a session [`Pool`].
///
/// All time bounds are wall-clock durations; a zero duration disables the
/// corresponding bound.
#[derive(Clone, Debug)]
pub struct Corral {
    pub(crate) min_sessions: u32,
    pub(crate) max_sessions: u32,
    pub(crate) acquire_timeout: Duration,
    pub(crate) max_lease: Duration,
    pub(crate) max_idle: Duration,
    pub(crate) scan_interval: Duration,
    pub(crate) evict_threshold: u32,
    pub(crate) interrupt_borrower: bool,
    pub(crate) close_evicted: bool,
    pub(crate) close_evicted_when_terminated: bool,
    pub(crate) fail_fast: bool,
}

impl Default for Corral {
    fn default() -> Self {
        Self::new()
    }
}

impl Corral {
    /// Construct `Self` with default options.
    ///
    /// See the source of this method for the current defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            min_sessions: 0,
            max_sessions: 10,
            acquire_timeout: Duration::from_secs(30),
            max_lease: Duration::from_secs(120),
            max_idle: Duration::from_secs(60),
            scan_interval: Duration::from_secs(1),
            evict_threshold: 3,
            interrupt_borrower: false,
            close_evicted: false,
            close_evicted_when_terminated: false,
            fail_fast: true,
        }
    }

    /// Set the number of sessions the pool opens during warmup and the
    /// floor below which the watcher will not prune idle sessions.
    ///
    /// The floor can be adjusted on a running pool with
    /// [`Pool::set_min_sessions`].
    #[must_use]
    pub fn min_sessions(mut self, min: u32) -> Self {
        self.min_sessions = min;
        self
    }

    /// Set the maximum number of sessions the pool will keep open.
    ///
    /// Growth past this bound is prevented even under heavy contention;
    /// callers instead wait for a session to be released.
    #[must_use]
    pub fn max_sessions(mut self, max: u32) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the default time budget for [`Pool::acquire`].
    ///
    /// Caps the total time an acquire may spend waiting for an idle
    /// session, opening a new one, and validating candidates. Can be
    /// overridden per call with [`Pool::acquire_timeout`].
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Set the default lease bound: how long a borrower may hold a session
    /// before the watcher starts warning about it and, eventually, evicts
    /// it. Zero disables lease enforcement.
    ///
    /// Can be overridden per acquire with [`Pool::acquire_with_lease`].
    #[must_use]
    pub fn max_lease(mut self, max_lease: Duration) -> Self {
        self.max_lease = max_lease;
        self
    }

    /// Set how long a session may sit idle before the watcher prunes it,
    /// provided the pool stays at or above its session floor. Zero
    /// disables idle pruning.
    #[must_use]
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the interval between watcher scans.
    #[must_use]
    pub fn scan_interval(mut self, interval: Duration) -> Self {
        self.scan_interval = interval;
        self
    }

    /// Set the number of consecutive lease expirations after which a
    /// session is evicted from the pool. Zero disables eviction, leaving
    /// repeated warnings as the only consequence of an expired lease.
    #[must_use]
    pub fn evict_threshold(mut self, threshold: u32) -> Self {
        self.evict_threshold = threshold;
        self
    }

    /// When enabled, the watcher fires the borrower's interrupt event on
    /// lease expiry, waking any wait parked in
    /// [`Borrower::do_until`](crate::Borrower::do_until).
    #[must_use]
    pub fn interrupt_borrower(mut self, interrupt: bool) -> Self {
        self.interrupt_borrower = interrupt;
        self
    }

    /// Whether the watcher closes the raw session of an evicted entry.
    ///
    /// Off by default: the session is left for the borrower to surrender
    /// on its eventual release, which closes it through the factory.
    #[must_use]
    pub fn close_evicted(mut self, close: bool) -> Self {
        self.close_evicted = close;
        self
    }

    /// Restrict eviction-time closing to sessions whose borrower has
    /// already terminated (its [`BorrowerGuard`](crate::BorrowerGuard) was
    /// dropped).
    #[must_use]
    pub fn close_evicted_when_terminated(mut self, only_terminated: bool) -> Self {
        self.close_evicted_when_terminated = only_terminated;
        self
    }

    /// Warmup failure policy for [`open`](Self::open): when `true` (the
    /// default), a session that cannot be opened during warmup fails the
    /// whole open and tears down anything created so far; when `false`,
    /// the failure is logged and the pool opens with fewer than
    /// `min_sessions` sessions.
    #[must_use]
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    /// `true` if any of the watcher's time bounds is configured.
    pub(crate) fn watcher_enabled(&self) -> bool {
        !self.max_lease.is_zero() || !self.max_idle.is_zero()
    }

    /// Open a pool backed by `factory`, warming up `min_sessions` sessions.
    pub async fn open<F: SessionFactory>(self, factory: F) -> Result<Pool<F>> {
        Pool::new(self, factory).await
    }
}
