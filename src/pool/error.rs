//! Errors raised by [`Pool`](super::Pool) operations.

use std::io;

use thiserror::Error;

/// Errors that may occur while checking connections out of or into the pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// The pool has been closed.
    #[error("pool closed")]
    PoolClosed,
    /// The pool stayed saturated for the whole wait timeout.
    #[error("wait for backend connection timed out")]
    WaitTimeout,
    /// A released connection had aged out or was already closed.
    #[error("connection expired")]
    ConnExpired,
    /// Dialing a new backend connection failed.
    #[error("new backend connection failed: {0}")]
    Connect(#[source] io::Error),
}
