use futures_core::future::BoxFuture;

use crate::Result;

/// The single plug-in surface of the pool: opens, validates, and closes raw
/// database sessions.
///
/// The pool owns exactly one factory for its lifetime and calls it from the
/// acquiring task, from release paths, and from the background watcher. A
/// factory is therefore shared state and must be cheap to call concurrently.
///
/// Concrete factories for particular databases live outside this crate; the
/// pool never looks inside [`Session`](Self::Session).
pub trait SessionFactory: Send + Sync + 'static {
    /// The raw session handle lent to borrowers.
    type Session: Send + 'static;

    /// Open a new session.
    ///
    /// Errors surface directly to the acquiring caller, except during pool
    /// warmup with [`fail_fast`](crate::Corral::fail_fast) disabled, where
    /// they are logged and absorbed.
    fn open(&self) -> BoxFuture<'_, Result<Self::Session>>;

    /// Check that an idle session is still usable before it is lent out.
    ///
    /// Must be cheap and bounded. Any error means "this session is bad";
    /// the pool discards it and retries with another.
    fn validate<'s>(&'s self, session: &'s mut Self::Session) -> BoxFuture<'s, Result<()>>;

    /// Finalize a session, best effort.
    ///
    /// When `rollback` is set the session may be mid-transaction; the
    /// factory should attempt a rollback before closing unless the session
    /// is in autocommit mode. Failures are the factory's to log; the pool
    /// never propagates them.
    fn close(&self, session: Self::Session, rollback: bool) -> BoxFuture<'_, ()>;

    /// Stable identity for log messages.
    fn describe(&self) -> String;
}
