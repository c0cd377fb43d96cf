//! An async session pool for database drivers.
//!
//! corral brokers a bounded set of live database sessions between
//! concurrent tasks: it opens sessions through a pluggable
//! [`SessionFactory`], validates them before lending them out, tracks how
//! long each borrower holds its lease, and runs a background watcher that
//! warns about, interrupts, and eventually evicts borrowers that never
//! give their session back, while pruning sessions that idle too long.
//!
//! Configure a pool with [`Corral`] and borrow sessions from [`Pool`]:
//!
//! ```ignore
//! let pool = Corral::new().max_sessions(5).open(factory).await?;
//! let lease = pool.acquire().await?;
//! let mut session = lease.session().await?;
//! // ... use the raw session ...
//! drop(session);
//! lease.release().await;
//! ```

/// Connection pool configuration.
mod corral;
/// Error types and result helpers.
pub mod error;
/// The driver-side contract for opening, validating, and closing sessions.
mod factory;
/// Pool implementation: registry, idle queue, and watcher.
mod pool;

pub use crate::{
    corral::Corral,
    error::{BoxDynError, Error, Result},
    factory::SessionFactory,
    pool::{Borrower, BorrowerGuard, CloseEvent, Pool, PoolSession, PoolStats, SessionGuard},
};
