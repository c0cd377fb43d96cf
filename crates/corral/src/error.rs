//! Types for working with errors produced by corral.

/// Boxed error type carried for failures originating inside a
/// [`SessionFactory`](crate::SessionFactory) implementation.
pub type BoxDynError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A specialized `Result` type for corral.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents all the ways a method can fail within corral.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// [`Pool::close`] was called, or had already been called when the
    /// operation started.
    ///
    /// [`Pool::close`]: crate::Pool::close
    #[error("attempted to acquire a session from a closed pool")]
    PoolClosed,

    /// A [`Pool::acquire`] call reached its deadline before an idle session
    /// became available or a new one could be opened.
    ///
    /// [`Pool::acquire`]: crate::Pool::acquire
    #[error("pool timed out while waiting for an open session")]
    AcquireTimedOut,

    /// The pool watcher interrupted the borrower because its lease expired.
    ///
    /// Returned by [`Borrower::do_until`](crate::Borrower::do_until); the
    /// borrower is expected to wind down and release its session.
    #[error("borrower interrupted by the pool watcher")]
    Interrupted,

    /// The raw session was taken out of an evicted or closing slot while a
    /// borrower still held the lease.
    #[error("session was revoked while leased")]
    SessionRevoked,

    /// Error returned from the session factory while opening or validating
    /// a session.
    #[error("session factory error: {0}")]
    Factory(#[source] BoxDynError),
}

impl Error {
    /// Wrap a factory-side failure.
    pub fn factory(err: impl Into<BoxDynError>) -> Self {
        Error::Factory(err.into())
    }
}
