//! Iso-address stack region.
//!
//! Every process reserves a stack region for task execution through the
//! transport's collective reservation. On a cluster backend the region is
//! congruent: the same virtual address range on every process, so a
//! suspended frame's raw bytes can be copied to a peer and resumed there
//! with every internal pointer (saved frame pointers, parent links) still
//! valid. The region is reserved before scheduling starts and must never
//! be reused for any other allocation for the lifetime of the process.

use crate::error::InitError;
use crate::transport::{RemotePtr, Transport};
use crate::util::options::RuntimeOptions;

/// Margin kept free above the guard page; a fork whose frame lands below
/// this watermark is treated as stack exhaustion before it can corrupt
/// anything.
const LOW_MARGIN: usize = 8 * 1024;

/// The reserved per-process stack region for task frames.
pub struct IsoSpace {
    base: *mut u8,
    size: usize,
    guarded: bool,
}

impl IsoSpace {
    /// Collectively reserve the region on every process.
    pub fn reserve(
        transport: &dyn Transport,
        options: &RuntimeOptions,
    ) -> Result<Self, InitError> {
        let size = options.stack_size;
        let base = transport.reserve_iso_stack(size)?;

        let guarded = options.stack_overflow_detection;
        if guarded {
            // stacks grow down: protect the lowest page so runaway
            // recursion faults instead of spilling into other memory
            // SAFETY: `base` is page-aligned (mmap) and owned by us.
            let rc = unsafe {
                libc::mprotect(base.as_mut_ptr(), page_size(), libc::PROT_NONE)
            };
            if rc != 0 {
                return Err(InitError::IsoStack(format!(
                    "guard page mprotect failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
        }

        tracing::debug!(
            base = base.as_usize(),
            size,
            guarded,
            "iso-address stack region reserved"
        );

        Ok(Self {
            base: base.as_mut_ptr(),
            size,
            guarded,
        })
    }

    /// Low bound of the region.
    #[inline]
    pub fn stack(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn stack_size(&self) -> usize {
        self.size
    }

    /// Initial stack pointer for the main task: the high end, 16-byte
    /// aligned.
    #[inline]
    pub fn initial_stack_ptr(&self) -> *mut u8 {
        ((self.base as usize + self.size) & !15) as *mut u8
    }

    /// Addresses below this are considered exhausted (guard page plus a
    /// safety margin).
    #[inline]
    pub fn low_watermark(&self) -> *mut u8 {
        let guard = if self.guarded { page_size() } else { 0 };
        // SAFETY: within the reserved region.
        unsafe { self.base.add(guard + LOW_MARGIN) }
    }

    #[inline]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let p = ptr as usize;
        let b = self.base as usize;
        p >= b && p < b + self.size
    }

    /// Collectively release the region.
    pub fn release(&mut self, transport: &dyn Transport) {
        if self.base.is_null() {
            return;
        }
        if self.guarded {
            // restore protection so the transport can unmap uniformly
            // SAFETY: same page we protected in `reserve`.
            unsafe {
                libc::mprotect(
                    self.base as *mut libc::c_void,
                    page_size(),
                    libc::PROT_READ | libc::PROT_WRITE,
                );
            }
        }
        transport.release_iso_stack(RemotePtr::new(self.base as usize), self.size);
        self.base = std::ptr::null_mut();
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz > 0 {
        sz as usize
    } else {
        4096
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::Loopback;

    #[test]
    fn test_reserve_and_release() {
        let transport = Loopback::new();
        let options = RuntimeOptions {
            stack_size: 128 * 1024,
            ..RuntimeOptions::default()
        };
        let mut ispace = IsoSpace::reserve(&transport, &options).unwrap();

        assert_eq!(ispace.stack_size(), 128 * 1024);
        assert!(ispace.contains(ispace.low_watermark()));
        assert!(!ispace.contains(std::ptr::null()));

        let sp = ispace.initial_stack_ptr();
        assert_eq!(sp as usize % 16, 0);
        assert!(ispace.contains(unsafe { sp.sub(1) }));

        // the usable part of the region is writable
        unsafe {
            std::ptr::write_bytes(ispace.low_watermark(), 0xCD, 4096);
        }

        ispace.release(&transport);
    }
}
