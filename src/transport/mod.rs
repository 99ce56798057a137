//! One-sided memory transport interface.
//!
//! The runtime never sends messages: all cross-process communication is
//! one-sided (get/put/atomic on a remote process's memory) plus a small set
//! of collectives. This module defines the [`Transport`] trait the scheduler
//! and future subsystem consume, and ships two implementations:
//!
//! - [`loopback::Loopback`]: a single-process transport where every remote
//!   operation degenerates to a local memory copy.
//! - [`shmem::ShmemGroup`]: N logical processes inside one address space
//!   (one OS thread each), for tests and single-node bring-up.
//!
//! A cluster backend (MPI/RDMA) implements the same trait out of tree.
//!
//! # Contracts
//!
//! - Collective operations (`malloc_shared`, `reserve_iso_stack`, `barrier`)
//!   must be invoked with identical arguments, in the same call order, on
//!   every process.
//! - `reserve_iso_stack` returns a range usable as the congruent iso-address
//!   stack: on a cluster backend the same virtual address range on every
//!   process. The shmem transport cannot satisfy congruence (one address
//!   space) and is therefore unsuitable for cross-process stack migration;
//!   it exists for protocol-level testing.
//! - Completion: when `get`/`put`/`fetch_and_add` return, the transfer has
//!   completed remotely. Visibility between processes is established only
//!   by completed one-sided operations, never by assumption.

pub mod loopback;
pub mod shmem;

use crate::error::InitError;

/// Process identity within the job, dense in `0..n_procs`.
pub type Pid = usize;

/// An address valid in some process's address space.
///
/// Remote addresses are plain numbers: they must never be dereferenced
/// directly except by the process that owns them (or, for iso-address stack
/// slots, by any process, which is the entire point of the iso range).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemotePtr(usize);

impl RemotePtr {
    #[inline]
    pub fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Byte-offset arithmetic.
    #[inline]
    pub fn add(self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    /// Reinterpret as a local pointer. Only valid on the owning process.
    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl<T> From<*mut T> for RemotePtr {
    fn from(p: *mut T) -> Self {
        Self(p as usize)
    }
}

/// One-sided memory operations and collectives consumed by the runtime.
pub trait Transport: Send + Sync {
    /// This process's identity.
    fn pid(&self) -> Pid;

    /// Number of processes in the job.
    fn n_procs(&self) -> usize;

    /// Collective allocation: every process allocates `size` bytes of
    /// remotely accessible, zeroed memory and the call returns the address
    /// of each process's chunk, indexed by pid.
    fn malloc_shared(&self, size: usize) -> Result<Vec<RemotePtr>, InitError>;

    /// Collective release of a `malloc_shared` allocation.
    fn free_shared(&self, ptrs: &[RemotePtr]);

    /// Collective reservation of the iso-address stack region.
    fn reserve_iso_stack(&self, size: usize) -> Result<RemotePtr, InitError>;

    /// Collective release of the iso-address stack region.
    fn release_iso_stack(&self, base: RemotePtr, size: usize);

    /// One-sided read of `size` bytes from `src` on `target` into `dst`.
    ///
    /// `dst`/`src` should be 4-byte aligned with `size` a multiple of 4 for
    /// tear-free word granularity; implementations fall back to byte copies
    /// otherwise.
    fn get(&self, dst: *mut u8, src: RemotePtr, size: usize, target: Pid);

    /// One-sided write of `size` bytes from `src` into `dst` on `target`.
    fn put(&self, dst: RemotePtr, src: *const u8, size: usize, target: Pid);

    /// One-sided word read.
    fn get_value_i32(&self, src: RemotePtr, target: Pid) -> i32;

    /// One-sided word write, ordered after all previously issued puts to
    /// the same target.
    fn put_value_i32(&self, dst: RemotePtr, value: i32, target: Pid);

    /// One-sided word read (64-bit).
    fn get_value_i64(&self, src: RemotePtr, target: Pid) -> i64;

    /// One-sided word write (64-bit).
    fn put_value_i64(&self, dst: RemotePtr, value: i64, target: Pid);

    /// Atomic remote fetch-and-add; returns the prior value.
    fn fetch_and_add(&self, dst: RemotePtr, delta: i32, target: Pid) -> i32;

    /// Blocking collective barrier.
    fn barrier(&self);

    /// Non-blocking barrier probe: returns true once every process has
    /// entered the current barrier phase. Never returns true early.
    fn barrier_try(&self) -> bool;

    /// Drain transport progress without blocking. Called periodically by
    /// the scheduler; backends with software progress engines rely on it.
    fn poll(&self);
}

/// Anonymous private mapping used by the in-crate transports to back the
/// iso-address stack region.
pub(crate) fn anon_mmap(size: usize) -> Result<RemotePtr, InitError> {
    // SAFETY: anonymous mapping, no fd, kernel picks the address.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(InitError::IsoStack(format!(
            "mmap of {size} bytes failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    Ok(RemotePtr::new(ptr as usize))
}

pub(crate) fn anon_munmap(base: RemotePtr, size: usize) {
    // SAFETY: `base` was returned by `anon_mmap` with the same size.
    unsafe {
        libc::munmap(base.as_mut_ptr(), size);
    }
}

/// Tear-free byte copy within one address space.
///
/// Remote memory has no cache coherence with ours; within the in-crate
/// transports "remote" memory is plain local memory that another thread may
/// concurrently access with atomics, so word-granularity atomic accesses
/// are used whenever alignment allows.
pub(crate) unsafe fn copy_coherent(dst: *mut u8, src: *const u8, size: usize) {
    use std::sync::atomic::{AtomicU32, Ordering};

    if dst as usize % 4 == 0 && src as usize % 4 == 0 && size % 4 == 0 {
        let words = size / 4;
        for i in 0..words {
            let s = AtomicU32::from_ptr(src.add(i * 4) as *mut u32).load(Ordering::Relaxed);
            AtomicU32::from_ptr(dst.add(i * 4) as *mut u32).store(s, Ordering::Relaxed);
        }
    } else {
        for i in 0..size {
            let b = std::ptr::read_volatile(src.add(i));
            std::ptr::write_volatile(dst.add(i), b);
        }
    }
}
