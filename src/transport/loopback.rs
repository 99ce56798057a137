//! Single-process transport.
//!
//! Every remote operation targets this process, so get/put are memory
//! copies and the collectives are no-ops. Used for single-node runs and as
//! the default transport in tests that exercise the scheduler end to end.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicI64, Ordering};

use parking_lot::Mutex;

use super::{anon_mmap, anon_munmap, RemotePtr, Transport};
use crate::error::InitError;

/// Alignment of shared allocations, generous enough for any slot type the
/// runtime stores in them.
const SHARED_ALIGN: usize = 64;

/// The single-process transport.
pub struct Loopback {
    /// Layouts of live shared allocations, keyed by address, for `free_shared`.
    allocs: Mutex<HashMap<usize, Layout>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self {
            allocs: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for Loopback {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for Loopback {
    #[inline]
    fn pid(&self) -> usize {
        0
    }

    #[inline]
    fn n_procs(&self) -> usize {
        1
    }

    fn malloc_shared(&self, size: usize) -> Result<Vec<RemotePtr>, InitError> {
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
        self.allocs.lock().insert(ptr as usize, layout);
        Ok(vec![RemotePtr::new(ptr as usize)])
    }

    fn free_shared(&self, ptrs: &[RemotePtr]) {
        let addr = ptrs[self.pid()].as_usize();
        if let Some(layout) = self.allocs.lock().remove(&addr) {
            // SAFETY: allocated by `malloc_shared` with this layout.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }

    fn reserve_iso_stack(&self, size: usize) -> Result<RemotePtr, InitError> {
        anon_mmap(size)
    }

    fn release_iso_stack(&self, base: RemotePtr, size: usize) {
        anon_munmap(base, size);
    }

    fn get(&self, dst: *mut u8, src: RemotePtr, size: usize, _target: usize) {
        // SAFETY: caller guarantees both ranges are valid; ranges may be
        // identical (self-transfer of an iso-address frame).
        unsafe { super::copy_coherent(dst, src.as_mut_ptr(), size) };
    }

    fn put(&self, dst: RemotePtr, src: *const u8, size: usize, _target: usize) {
        // SAFETY: as above.
        unsafe { super::copy_coherent(dst.as_mut_ptr(), src, size) };
    }

    fn get_value_i32(&self, src: RemotePtr, _target: usize) -> i32 {
        // SAFETY: `src` is a live, aligned i32 owned by this process.
        unsafe { AtomicI32::from_ptr(src.as_mut_ptr()).load(Ordering::SeqCst) }
    }

    fn put_value_i32(&self, dst: RemotePtr, value: i32, _target: usize) {
        // SAFETY: as above.
        unsafe { AtomicI32::from_ptr(dst.as_mut_ptr()).store(value, Ordering::SeqCst) }
    }

    fn get_value_i64(&self, src: RemotePtr, _target: usize) -> i64 {
        // SAFETY: as above.
        unsafe { AtomicI64::from_ptr(src.as_mut_ptr()).load(Ordering::SeqCst) }
    }

    fn put_value_i64(&self, dst: RemotePtr, value: i64, _target: usize) {
        // SAFETY: as above.
        unsafe { AtomicI64::from_ptr(dst.as_mut_ptr()).store(value, Ordering::SeqCst) }
    }

    fn fetch_and_add(&self, dst: RemotePtr, delta: i32, _target: usize) -> i32 {
        // SAFETY: as above.
        unsafe { AtomicI32::from_ptr(dst.as_mut_ptr()).fetch_add(delta, Ordering::SeqCst) }
    }

    #[inline]
    fn barrier(&self) {}

    #[inline]
    fn barrier_try(&self) -> bool {
        true
    }

    #[inline]
    fn poll(&self) {}
}

impl Drop for Loopback {
    fn drop(&mut self) {
        let allocs = self.allocs.get_mut();
        for (&addr, &layout) in allocs.iter() {
            // SAFETY: remaining live allocations were made by `malloc_shared`.
            unsafe { dealloc(addr as *mut u8, layout) };
        }
        allocs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malloc_shared_roundtrip() {
        let t = Loopback::new();
        let ptrs = t.malloc_shared(64).unwrap();
        assert_eq!(ptrs.len(), 1);
        assert!(!ptrs[0].is_null());

        // zeroed on allocation
        assert_eq!(t.get_value_i32(ptrs[0], 0), 0);

        t.put_value_i32(ptrs[0], 7, 0);
        assert_eq!(t.get_value_i32(ptrs[0], 0), 7);
        assert_eq!(t.fetch_and_add(ptrs[0], 1, 0), 7);
        assert_eq!(t.get_value_i32(ptrs[0], 0), 8);

        t.free_shared(&ptrs);
    }

    #[test]
    fn test_get_put_bytes() {
        let t = Loopback::new();
        let ptrs = t.malloc_shared(16).unwrap();

        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        t.put(ptrs[0], src.as_ptr(), src.len(), 0);

        let mut dst = [0u8; 8];
        t.get(dst.as_mut_ptr(), ptrs[0], dst.len(), 0);
        assert_eq!(src, dst);

        t.free_shared(&ptrs);
    }

    #[test]
    fn test_iso_stack_reserve() {
        let t = Loopback::new();
        let base = t.reserve_iso_stack(64 * 1024).unwrap();
        assert!(!base.is_null());
        // the region is writable
        unsafe { std::ptr::write_bytes(base.as_mut_ptr::<u8>(), 0xAB, 64 * 1024) };
        t.release_iso_stack(base, 64 * 1024);
    }
}
