//! Core error kinds (spec §7).

use thiserror::Error;

/// Error kinds surfaced by the core.
///
/// Propagation rule: slot-local state is always restored before one of
/// these leaves the core — no object is left `UNDER_WB` or
/// `UNDER_FAULTOUT` after a call returns, success or failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Transient condition; caller retries or treats as a no-op.
    #[error("transient condition, retry")]
    Again,
    /// The extent bitmap is full.
    #[error("extent bitmap exhausted")]
    NoSpace,
    /// A referenced extent or object id is stale.
    #[error("not found")]
    NotFound,
    /// Priv-bit contention on an extent; caller polls.
    #[error("extent busy")]
    Busy,
    /// Block-layer I/O error.
    #[error("i/o failed")]
    IoFailed,
    /// A request-scheduling control block could not be allocated.
    #[error("out of memory")]
    OutOfMemory,
    /// Programmer error: out-of-range index, inconsistent state.
    #[error("invalid argument")]
    Invalid,
}

pub type Result<T> = std::result::Result<T, Error>;
