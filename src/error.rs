//! Runtime error taxonomy.
//!
//! Every fallible operation in the crate reports one of the variants below.
//! `Cancelled` is not a user error: it is the signal delivered to awaiters of
//! a task whose scope was cancelled, and it propagates along await edges
//! until a caller chooses to absorb it.

use thiserror::Error;

/// The error type used throughout the runtime.
///
/// Variants are `Clone` because a task's failure outcome is cached and
/// re-raised to every awaiter rather than being consumed by the first one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The task (or its enclosing scope) was cancelled before completion.
    #[error("task was cancelled")]
    Cancelled,

    /// A `with_timeout` deadline expired before the guarded body finished.
    #[error("deadline elapsed before completion")]
    Timeout,

    /// A send on a closed channel, or a receive on a closed channel whose
    /// buffer has drained.
    #[error("channel is closed")]
    Closed,

    /// An operation violated a usage contract, e.g. closing a channel twice
    /// or releasing a mutex from a task that does not hold it.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The task's body panicked. The payload message is captured at the task
    /// boundary and re-raised to every awaiter.
    #[error("task failed: {0}")]
    Failed(String),
}

/// Convenience alias used by the runtime's own signatures.
pub type Result<T> = std::result::Result<T, Error>;
