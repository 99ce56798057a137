//! Shared-memory transport: N logical processes in one address space.
//!
//! Each logical process is driven by one OS thread holding its own
//! [`ShmemTransport`]. Remote operations are memory copies and atomics on
//! the peer's chunks; collectives rendezvous through the shared group
//! state. This is the bring-up and test backend: it implements the full
//! transport contract *except* iso-address congruence, which is impossible
//! inside a single address space (see the module docs in
//! [`crate::transport`]), so it must not be used to migrate stack frames.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{anon_mmap, anon_munmap, Pid, RemotePtr, Transport};
use crate::error::InitError;

const SHARED_ALIGN: usize = 64;

/// One collective allocation in flight: each participant publishes its own
/// chunk address and waits until all have.
struct AllocSlot {
    ptrs: Vec<usize>,
    filled: usize,
    taken: usize,
}

struct GroupShared {
    n: usize,
    rendezvous: Mutex<HashMap<u64, AllocSlot>>,
    rendezvous_cond: Condvar,
    /// Live allocation layouts, keyed by address.
    allocs: Mutex<HashMap<usize, Layout>>,
    bar_count: AtomicUsize,
    bar_gen: AtomicUsize,
}

/// Factory for a group of shared-memory logical processes.
pub struct ShmemGroup;

impl ShmemGroup {
    /// Create the transports of an `n`-process group. Hand one to each
    /// thread acting as a logical process.
    pub fn create(n: usize) -> Vec<Arc<ShmemTransport>> {
        assert!(n > 0, "a process group needs at least one member");
        let shared = Arc::new(GroupShared {
            n,
            rendezvous: Mutex::new(HashMap::new()),
            rendezvous_cond: Condvar::new(),
            allocs: Mutex::new(HashMap::new()),
            bar_count: AtomicUsize::new(0),
            bar_gen: AtomicUsize::new(0),
        });
        (0..n)
            .map(|pid| {
                Arc::new(ShmemTransport {
                    pid,
                    shared: shared.clone(),
                    alloc_seq: AtomicU64::new(0),
                    bar_arrived: AtomicBool::new(false),
                    bar_seen_gen: AtomicUsize::new(0),
                })
            })
            .collect()
    }
}

/// One logical process's endpoint into a [`ShmemGroup`].
pub struct ShmemTransport {
    pid: Pid,
    shared: Arc<GroupShared>,
    /// Collective call counter; matches calls across processes by order.
    alloc_seq: AtomicU64,
    /// Whether this process has entered the current barrier phase.
    bar_arrived: AtomicBool,
    /// Last barrier generation this process has observed completing.
    bar_seen_gen: AtomicUsize,
}

impl Transport for ShmemTransport {
    #[inline]
    fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    fn n_procs(&self) -> usize {
        self.shared.n
    }

    fn malloc_shared(&self, size: usize) -> Result<Vec<RemotePtr>, InitError> {
        let seq = self.alloc_seq.fetch_add(1, Ordering::Relaxed);

        let layout = Layout::from_size_align(size.max(1), SHARED_ALIGN)
            .map_err(|_| InitError::SharedAlloc {
                what: "shared chunk",
                size,
            })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(InitError::SharedAlloc {
                what: "shared chunk",
                size,
            });
        }
        self.shared.allocs.lock().insert(ptr as usize, layout);

        let mut map = self.shared.rendezvous.lock();
        {
            let slot = map.entry(seq).or_insert_with(|| AllocSlot {
                ptrs: vec![0; self.shared.n],
                filled: 0,
                taken: 0,
            });
            slot.ptrs[self.pid] = ptr as usize;
            slot.filled += 1;
            if slot.filled == self.shared.n {
                self.shared.rendezvous_cond.notify_all();
            }
        }
        loop {
            let slot = map.get(&seq).expect("rendezvous slot vanished");
            if slot.filled == self.shared.n {
                break;
            }
            self.shared.rendezvous_cond.wait(&mut map);
        }
        let slot = map.get_mut(&seq).expect("rendezvous slot vanished");
        let result: Vec<RemotePtr> = slot.ptrs.iter().map(|&a| RemotePtr::new(a)).collect();
        slot.taken += 1;
        if slot.taken == self.shared.n {
            map.remove(&seq);
        }
        Ok(result)
    }

    fn free_shared(&self, ptrs: &[RemotePtr]) {
        let addr = ptrs[self.pid].as_usize();
        if let Some(layout) = self.shared.allocs.lock().remove(&addr) {
            // SAFETY: allocated by `malloc_shared` with this layout.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }

    fn reserve_iso_stack(&self, size: usize) -> Result<RemotePtr, InitError> {
        // Not congruent across the group; documented limitation.
        anon_mmap(size)
    }

    fn release_iso_stack(&self, base: RemotePtr, size: usize) {
        anon_munmap(base, size);
    }

    fn get(&self, dst: *mut u8, src: RemotePtr, size: usize, _target: Pid) {
        // SAFETY: caller guarantees both ranges are valid for the duration
        // of the call; protocol-level locking keeps byte ranges race-free.
        unsafe { super::copy_coherent(dst, src.as_mut_ptr(), size) };
    }

    fn put(&self, dst: RemotePtr, src: *const u8, size: usize, _target: Pid) {
        // SAFETY: as above.
        unsafe { super::copy_coherent(dst.as_mut_ptr(), src, size) };
    }

    fn get_value_i32(&self, src: RemotePtr, _target: Pid) -> i32 {
        // SAFETY: `src` is a live, aligned i32 in the group's shared memory.
        unsafe { AtomicI32::from_ptr(src.as_mut_ptr()).load(Ordering::SeqCst) }
    }

    fn put_value_i32(&self, dst: RemotePtr, value: i32, _target: Pid) {
        // SAFETY: as above.
        unsafe { AtomicI32::from_ptr(dst.as_mut_ptr()).store(value, Ordering::SeqCst) }
    }

    fn get_value_i64(&self, src: RemotePtr, _target: Pid) -> i64 {
        // SAFETY: as above.
        unsafe { AtomicI64::from_ptr(src.as_mut_ptr()).load(Ordering::SeqCst) }
    }

    fn put_value_i64(&self, dst: RemotePtr, value: i64, _target: Pid) {
        // SAFETY: as above.
        unsafe { AtomicI64::from_ptr(dst.as_mut_ptr()).store(value, Ordering::SeqCst) }
    }

    fn fetch_and_add(&self, dst: RemotePtr, delta: i32, _target: Pid) -> i32 {
        // SAFETY: as above.
        unsafe { AtomicI32::from_ptr(dst.as_mut_ptr()).fetch_add(delta, Ordering::SeqCst) }
    }

    fn barrier(&self) {
        while !self.barrier_try() {
            self.poll();
        }
    }

    fn barrier_try(&self) -> bool {
        let shared = &self.shared;

        if !self.bar_arrived.load(Ordering::Relaxed) {
            self.bar_arrived.store(true, Ordering::Relaxed);
            let prev = shared.bar_count.fetch_add(1, Ordering::AcqRel);
            if prev + 1 == shared.n {
                // last arrival completes the phase
                shared.bar_count.store(0, Ordering::Relaxed);
                shared.bar_gen.fetch_add(1, Ordering::Release);
            }
        }

        let gen = shared.bar_gen.load(Ordering::Acquire);
        if gen > self.bar_seen_gen.load(Ordering::Relaxed) {
            self.bar_seen_gen.store(gen, Ordering::Relaxed);
            self.bar_arrived.store(false, Ordering::Relaxed);
            true
        } else {
            false
        }
    }

    fn poll(&self) {
        std::thread::yield_now();
    }
}

impl Drop for GroupShared {
    fn drop(&mut self) {
        let allocs = self.allocs.get_mut();
        for (&addr, &layout) in allocs.iter() {
            // SAFETY: remaining live allocations were made by `malloc_shared`.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
        allocs.clear();
    }
}
