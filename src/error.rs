//! Recoverable and fatal error taxonomy for the mm core.
//!
//! `MmError` covers every condition a caller can sensibly handle and retry
//! or report upward. Conditions spec.md calls "Fatal" (double-free,
//! poison/redzone corruption, an impossible page-state transition) are
//! deliberately not variants here: they're not recoverable `Result`s a
//! caller could match on and continue past, so they go through `fatal!`
//! instead, which logs and then panics.

/// A recoverable mm-core error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmError {
    /// No memory available to satisfy the request at the requested order/
    /// node, after reclaim (if the caller allowed it) was already tried.
    OutOfMemory,
    /// A request violates an API-level precondition (bad alignment, a
    /// range outside the caller's own VMA, an unsupported flag combination).
    Invalid(&'static str),
    /// The operation needs to be retried after dropping and reacquiring a
    /// lock (e.g. a fault handler that had to block on a wait-queue).
    Retry,
    /// A user-mode access fell outside any mapped VMA.
    SegFault,
    /// A user-mode access hit a mapped VMA in a way the backing object
    /// can't service (e.g. writing past a device mapping's bound).
    BusError,
}

impl core::fmt::Display for MmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MmError::OutOfMemory => write!(f, "out of memory"),
            MmError::Invalid(msg) => write!(f, "invalid argument: {msg}"),
            MmError::Retry => write!(f, "operation must be retried"),
            MmError::SegFault => write!(f, "segmentation fault"),
            MmError::BusError => write!(f, "bus error"),
        }
    }
}

pub type MmResult<T> = Result<T, MmError>;

/// Log a fatal condition and abort. Used for invariant violations spec.md
/// marks Fatal: there's no cleanup to attempt and no caller that could
/// sensibly resume, so this never returns.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        ::eonix_log::println_fatal!($($arg)*);
        panic!($($arg)*);
    }};
}
