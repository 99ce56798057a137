//! Error and fatal-abort types for the runtime.
//!
//! The split mirrors the original runtime's `die` path: recoverable startup
//! problems surface as [`InitError`] (a `Result`), capacity exhaustion that a
//! correct program must never hit surfaces as [`Fatal`] and is funneled
//! through [`die`], and non-fatal work-stealing contention is reported as
//! [`StealFailure`] for statistics only.

use thiserror::Error;

/// A recoverable failure during process / runtime initialization.
#[derive(Debug, Error)]
pub enum InitError {
    /// Reserving or guarding the iso-address stack region failed.
    #[error("iso-address stack: {0}")]
    IsoStack(String),

    /// A scheduler worker was entered more than once.
    #[error("scheduler already entered on this thread")]
    AlreadyEntered,

    /// A shared (collective) allocation could not be satisfied.
    #[error("shared allocation of {what} ({size} bytes) failed")]
    SharedAlloc {
        /// Human-readable description of what was being allocated.
        what: &'static str,
        /// Requested size in bytes.
        size: usize,
    },
}

/// A fatal, non-recoverable condition: a fixed-capacity structure overflowed.
///
/// These are detected as `Result`s so that overflow is deterministically
/// testable, then passed to [`die`] on the real hot path.
#[derive(Debug, Error)]
pub enum Fatal {
    /// The task queue ran out of entry slots.
    #[error("task queue overflow: {live} live entries, capacity {capacity}")]
    TaskQueueOverflow {
        /// Number of live entries at the point of overflow.
        live: usize,
        /// Total entry capacity.
        capacity: usize,
    },

    /// The iso-address stack region was exhausted by deep forking.
    #[error("iso-address stack exhausted: used {used} of {total} bytes")]
    IsoStackExhausted {
        /// Bytes consumed.
        used: usize,
        /// Total region size in bytes.
        total: usize,
    },

    /// The future pool had no room for another future entry.
    #[error(
        "future pool overflow: used {used} of {capacity} bytes, requested {requested}"
    )]
    FuturePoolOverflow {
        /// Bytes already in use.
        used: usize,
        /// Total pool capacity in bytes.
        capacity: usize,
        /// Bytes requested by the failing allocation.
        requested: usize,
    },

    /// The return pool on the home process could not accept a result.
    #[error("return pool overflow: capacity {capacity}")]
    ReturnPoolOverflow {
        /// Total return-pool capacity.
        capacity: usize,
    },
}

/// The outcome of a failed steal attempt. Non-fatal; recorded for statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StealFailure {
    /// The steal was aborted (e.g. the victim won a race on the slot).
    Aborted,
    /// A lock on the victim's queue was contended.
    LockContended,
    /// The victim's queue turned out to be empty after the race.
    EmptyRace,
}

/// Log a fatal condition and abort the process. Never returns.
pub fn die(fatal: Fatal) -> ! {
    tracing::error!(error = %fatal, "fatal: aborting process");
    eprintln!("isoweave fatal: {fatal}");
    std::process::abort();
}
