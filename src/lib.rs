//! isoweave — a fine-grained fork-join task runtime for clusters without
//! shared memory.
//!
//! Programs spawn millions of lightweight tasks that are load-balanced
//! across processes (one per node) by work stealing. There is no OS-thread
//! parallelism inside a process: concurrency comes entirely from
//! cooperative scheduling plus one-sided remote memory operations. Every
//! process keeps its task stacks in a region mapped at a congruent address
//! range (the *iso-address space*), so a suspended call frame can be
//! shipped to another process byte-for-byte and resumed there without
//! pointer relocation.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use isoweave::{Future, Loopback, Process};
//!
//! fn tree(depth: u32) -> u64 {
//!     if depth == 0 {
//!         return 1;
//!     }
//!     let right = Future::spawn(move || tree(depth - 1));
//!     let left = tree(depth - 1);
//!     left + right.touch()
//! }
//!
//! let mut process = Process::init(Arc::new(Loopback::new())).unwrap();
//! process.start(|| {
//!     assert_eq!(tree(5), 32);
//! }).unwrap();
//! process.finalize();
//! ```

#![warn(rust_2018_idioms)]

pub mod error;
pub mod runtime;
pub mod transport;
pub mod util;

// Re-exports
pub use anyhow::Result;
pub use error::{Fatal, InitError};
pub use runtime::future::Future;
pub use runtime::process::Process;
pub use runtime::scheduler::StealStats;
pub use transport::loopback::Loopback;
pub use transport::shmem::{ShmemGroup, ShmemTransport};
pub use transport::{Pid, Transport};
pub use util::options::RuntimeOptions;

use once_cell::sync::Lazy;
use std::time::Instant;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// This process's identity. Valid only inside [`Process::start`].
pub fn pid() -> Pid {
    // SAFETY: current() panics with a clear message outside task context.
    unsafe {
        let w = runtime::scheduler::current();
        (*w).transport().pid()
    }
}

/// Number of processes in the job. Valid only inside [`Process::start`].
pub fn n_procs() -> usize {
    // SAFETY: as above.
    unsafe {
        let w = runtime::scheduler::current();
        (*w).transport().n_procs()
    }
}

/// Scheduler-cooperative barrier across all processes: while waiting for
/// peers, this process keeps doing scheduler work (serving its wait queue,
/// polling the transport). Valid only inside [`Process::start`].
pub fn barrier() {
    // SAFETY: as above.
    unsafe {
        let w = runtime::scheduler::current();
        runtime::scheduler::cooperative_barrier(w);
    }
}

/// Drain transport progress without blocking. Valid only inside
/// [`Process::start`].
pub fn poll() {
    // SAFETY: as above.
    unsafe {
        let w = runtime::scheduler::current();
        (*w).transport().poll();
    }
}

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Monotonic tick counter in nanoseconds, for benchmark-style timing.
pub fn tick() -> u64 {
    EPOCH.elapsed().as_nanos() as u64
}

/// Monotonic time in seconds.
pub fn time() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}
