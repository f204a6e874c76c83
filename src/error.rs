//! Error types for the engine.
//!
//! The taxonomy is deliberately small: only facility unavailability and a
//! broken ring protocol are errors of the engine itself. Backpressure is a
//! return value, registry degradation is absorbed internally, and
//! per-operation kernel faults travel through the operation's own callback
//! as a negative result.

use std::io;

use thiserror::Error;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the engine itself.
///
/// Per-operation failures are never represented here; they are delivered to
/// the owning operation's callback as the raw negated OS error code, exactly
/// as the kernel reported it.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The running kernel does not support io_uring.
    ///
    /// Returned from engine construction, before any ring setup is
    /// attempted. Never fatal to the host process; the host is expected to
    /// fall back to its readiness-based backend.
    #[error("io_uring is not available on this kernel")]
    NotAvailable,

    /// The engine configuration failed validation.
    #[error("invalid engine configuration: {reason}")]
    InvalidConfig {
        /// Human-readable description of the rejected setting.
        reason: String,
    },

    /// The kernel kept rejecting the submit call past the retry ceiling.
    ///
    /// This indicates the ring protocol is broken (for example a completion
    /// queue that is never drained) and the engine can make no further
    /// progress. Unrecoverable.
    #[error("submission rejected {attempts} times; ring protocol is broken")]
    SubmitRetriesExhausted {
        /// Number of submit attempts made before giving up.
        attempts: u32,
    },

    /// An OS-level failure outside the per-operation path.
    ///
    /// Raised from ring setup and teardown; in-flight operations report
    /// their errors through their callbacks instead.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

// Callbacks and descriptors pin the engine to one thread, but the error
// type itself crosses thread boundaries when the host reports failures.
static_assertions::assert_impl_all!(EngineError: Send, Sync);
