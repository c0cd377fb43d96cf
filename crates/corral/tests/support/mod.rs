#![allow(dead_code)]

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use corral::{Error, Result, SessionFactory};
use futures::future::BoxFuture;

/// In-memory stand-in for a database driver: every session is a numbered
/// token, and the factory counts everything the pool does to it.
pub struct TestFactory {
    state: Arc<FactoryState>,
}

#[derive(Default)]
pub struct FactoryState {
    opened: AtomicUsize,
    closed: AtomicUsize,
    rollbacks: AtomicUsize,
    validated: AtomicUsize,
    fail_open: AtomicBool,
    fail_open_after: AtomicUsize,
    fail_validate: AtomicBool,
}

#[derive(Debug, PartialEq)]
pub struct TestSession {
    pub id: usize,
}

impl TestFactory {
    pub fn new() -> Self {
        let state = Arc::new(FactoryState::default());
        state.fail_open_after.store(usize::MAX, Ordering::SeqCst);
        Self { state }
    }

    /// Shared handle to the counters, usable after the factory has been
    /// moved into a pool.
    pub fn state(&self) -> Arc<FactoryState> {
        Arc::clone(&self.state)
    }
}

impl FactoryState {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    pub fn validated(&self) -> usize {
        self.validated.load(Ordering::SeqCst)
    }

    pub fn fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }

    /// Let `n` opens succeed, then fail the rest.
    pub fn fail_open_after(&self, n: usize) {
        self.fail_open_after.store(n, Ordering::SeqCst);
    }

    pub fn fail_validate(&self, fail: bool) {
        self.fail_validate.store(fail, Ordering::SeqCst);
    }
}

impl SessionFactory for TestFactory {
    type Session = TestSession;

    fn open(&self) -> BoxFuture<'_, Result<TestSession>> {
        Box::pin(async move {
            if self.state.fail_open.load(Ordering::SeqCst)
                || self.state.opened() >= self.state.fail_open_after.load(Ordering::SeqCst)
            {
                return Err(Error::factory("injected open failure"));
            }
            let id = self.state.opened.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(TestSession { id })
        })
    }

    fn validate<'s>(&'s self, _session: &'s mut TestSession) -> BoxFuture<'s, Result<()>> {
        Box::pin(async move {
            self.state.validated.fetch_add(1, Ordering::SeqCst);
            if self.state.fail_validate.load(Ordering::SeqCst) {
                return Err(Error::factory("injected validation failure"));
            }
            Ok(())
        })
    }

    fn close(&self, _session: TestSession, rollback: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if rollback {
                self.state.rollbacks.fetch_add(1, Ordering::SeqCst);
            }
            self.state.closed.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn describe(&self) -> String {
        "test-sessions".into()
    }
}
