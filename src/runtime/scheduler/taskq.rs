//! Per-process task queue with remote steal.
//!
//! Single owner, multiple thieves. The owner pushes and pops continuations
//! at the `top` end without taking the lock in the common case; thieves
//! steal from the `base` end under a single-word lock manipulated with
//! remote fetch-and-add. The queue header and the entry array live in
//! transport-shared memory so thieves can reach them with one-sided
//! operations.
//!
//! There is no cache coherence between processes: every index mutation
//! that crosses the owner/thief boundary is bracketed by explicit fences
//! on the owner side and by completed one-sided operations on the thief
//! side. Nothing is ever assumed visible.

use std::mem::offset_of;
use std::sync::atomic::{fence, AtomicI32, Ordering};

use crate::error::Fatal;
use crate::runtime::context::Context;
use crate::transport::{Pid, RemotePtr, Transport};

/// A continuation still physically resident on its owner's call stack.
///
/// `frame_base ≤ ctx < frame_base + frame_size`, and the parent context
/// referenced by `ctx` lies in the same range; both hold in every valid
/// entry and are checked by [`TaskqEntry::debug_validate`].
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TaskqEntry {
    pub frame_base: *mut u8,
    pub frame_size: usize,
    pub ctx: *mut Context,
}

impl TaskqEntry {
    /// Check the frame-bounds invariants. Compiled out of release builds;
    /// a violation means a corrupted continuation, which has no recovery.
    #[inline]
    pub fn debug_validate(&self) {
        debug_assert!(self.frame_base <= self.ctx as *mut u8);
        debug_assert!((self.ctx as *mut u8) < unsafe { self.frame_base.add(self.frame_size) });
        debug_assert!(!unsafe { (*self.ctx).parent.is_null() });
        debug_assert!(self.frame_base <= unsafe { (*self.ctx).parent as *mut u8 });
        debug_assert!(
            (unsafe { (*self.ctx).parent } as *mut u8)
                < unsafe { self.frame_base.add(self.frame_size) }
        );
    }
}

/// Remotely readable prefix of the queue header.
///
/// Thieves snapshot these four words with a single one-sided get; the
/// layout must stay in lockstep with [`TaskQueue`].
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskqSnapshot {
    pub top: i32,
    pub base: i32,
    pub n_entries: i32,
    pub lock: i32,
}

/// Queue header, placement-initialized inside transport-shared memory.
///
/// `top` and `base` start at the array midpoint so the live range can grow
/// in both directions; `top - base` is the number of available entries.
#[repr(C)]
pub struct TaskQueue {
    top: AtomicI32,
    base: AtomicI32,
    n_entries: i32,
    lock: AtomicI32,
    entries: *mut TaskqEntry,
}

/// Byte length of the header prefix a thief snapshots.
pub const SNAPSHOT_BYTES: usize = std::mem::size_of::<TaskqSnapshot>();

impl TaskQueue {
    /// Placement-initialize a queue header over shared memory.
    ///
    /// # Safety
    /// `header` and `entries` must point to zero-initialized shared chunks
    /// of at least `size_of::<TaskQueue>()` and
    /// `n_entries * size_of::<TaskqEntry>()` bytes respectively.
    pub unsafe fn init_at(header: *mut TaskQueue, entries: *mut TaskqEntry, n_entries: usize) {
        assert!(n_entries >= 2 && n_entries <= i32::MAX as usize);
        let mid = (n_entries / 2) as i32;
        header.write(TaskQueue {
            top: AtomicI32::new(mid),
            base: AtomicI32::new(mid),
            n_entries: n_entries as i32,
            lock: AtomicI32::new(0),
            entries,
        });
    }

    /// Number of available entries in a consistent owner-side view.
    #[inline]
    pub fn len(&self) -> usize {
        let t = self.top.load(Ordering::Relaxed);
        let b = self.base.load(Ordering::Relaxed);
        (t - b).max(0) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.n_entries as usize
    }

    fn local_trylock(&self) -> bool {
        self.lock.fetch_add(1, Ordering::SeqCst) == 0
    }

    fn local_lock(&self, transport: &dyn Transport) {
        while !self.local_trylock() {
            transport.poll();
        }
    }

    fn local_unlock(&self) {
        fence(Ordering::Release);
        self.lock.store(0, Ordering::SeqCst);
    }

    /// Owner push. Lock-free unless the live range has hit the array end,
    /// in which case the range is recentered under the local lock.
    ///
    /// # Safety
    /// Must only be called by the owning process's worker.
    pub unsafe fn push(&self, entry: TaskqEntry, transport: &dyn Transport) -> Result<(), Fatal> {
        let mut t = self.top.load(Ordering::Relaxed);

        fence(Ordering::Acquire);

        if t == self.n_entries {
            self.local_lock(transport);

            let b = self.base.load(Ordering::Relaxed);
            if b == 0 {
                self.local_unlock();
                return Err(Fatal::TaskQueueOverflow {
                    live: (t - b) as usize,
                    capacity: self.n_entries as usize,
                });
            }

            // shift the live range toward the array middle, leaving room
            // on both ends
            let offset_x2 = self.n_entries - (b + t);
            let mut offset = offset_x2 / 2;
            if offset_x2 % 2 != 0 {
                offset -= 1;
            }

            if t - b != 0 {
                let dst = (b + offset) as usize;
                let src = b as usize;
                let count = (t - b) as usize;
                std::ptr::copy(self.entries.add(src), self.entries.add(dst), count);
            }

            t += offset;
            self.top.store(t, Ordering::Relaxed);
            self.base.store(b + offset, Ordering::Relaxed);

            self.local_unlock();
        }

        self.entries.add(t as usize).write(entry);

        fence(Ordering::Release);

        self.top.store(t + 1, Ordering::Relaxed);

        tracing::trace!(top = t + 1, "pushed continuation");
        Ok(())
    }

    /// Owner pop of the topmost entry.
    ///
    /// The decrement of `top` is speculative: if the remaining gap to
    /// `base` is large no thief can be contending for the same entry and
    /// no lock is needed. Near-empty, the owner takes the local lock; if a
    /// thief won the race for the last entry the indices are reset to the
    /// array midpoint and `None` is returned.
    ///
    /// # Safety
    /// Must only be called by the owning process's worker.
    pub unsafe fn pop(&self) -> Option<TaskqEntry> {
        let t = self.top.load(Ordering::Relaxed) - 1;
        self.top.store(t, Ordering::Relaxed);

        fence(Ordering::SeqCst);

        let b = self.base.load(Ordering::Relaxed);

        if b + 1 < t {
            return Some(self.entries.add(t as usize).read());
        }

        // the gap is narrow: a thief may be claiming this entry
        self.local_trylock_spin();

        let b = self.base.load(Ordering::Relaxed);

        let result = if b <= t {
            Some(self.entries.add(t as usize).read())
        } else {
            // a thief claimed the last entry; queue emptied
            let mid = self.n_entries / 2;
            self.top.store(mid, Ordering::Relaxed);
            self.base.store(mid, Ordering::Relaxed);
            None
        };

        self.local_unlock();

        result
    }

    /// Spin for the local lock without transport polling. Pop must block
    /// only for the duration of a thief's critical section, which contains
    /// no scheduling.
    fn local_trylock_spin(&self) {
        while !self.local_trylock() {
            std::hint::spin_loop();
        }
    }
}

/// A thief's capability to one remote queue: target process, remote header
/// address, remote entry array address. All mutation happens through
/// one-sided operations; the lock discipline is the pair
/// [`RemoteQueue::try_lock`] / [`RemoteQueue::unlock`].
pub struct RemoteQueue<'a> {
    transport: &'a dyn Transport,
    target: Pid,
    header: RemotePtr,
    entries: RemotePtr,
}

impl<'a> RemoteQueue<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        target: Pid,
        header: RemotePtr,
        entries: RemotePtr,
    ) -> Self {
        Self {
            transport,
            target,
            header,
            entries,
        }
    }

    #[inline]
    pub fn target(&self) -> Pid {
        self.target
    }

    fn snapshot(&self) -> TaskqSnapshot {
        let mut snap = TaskqSnapshot::default();
        self.transport.get(
            &mut snap as *mut TaskqSnapshot as *mut u8,
            self.header,
            SNAPSHOT_BYTES,
            self.target,
        );
        snap
    }

    /// Cheap pre-check: observe whether the victim's queue looked empty.
    pub fn is_empty(&self) -> bool {
        let snap = self.snapshot();
        snap.base >= snap.top
    }

    /// Try to acquire the victim queue's steal lock. Success iff the prior
    /// lock word was zero.
    pub fn try_lock(&self) -> bool {
        let lock = self.header.add(offset_of!(TaskQueue, lock));
        self.transport.fetch_and_add(lock, 1, self.target) == 0
    }

    /// Release the victim queue's steal lock.
    pub fn unlock(&self) {
        Self::unlock_raw(self.transport, self.header, self.target);
    }

    /// Unlock without a constructed `RemoteQueue`; the stolen-frame resume
    /// path releases the lock after the stack transfer completes, at a
    /// point where only the raw header address survives.
    pub fn unlock_raw(transport: &dyn Transport, header: RemotePtr, target: Pid) {
        let lock = header.add(offset_of!(TaskQueue, lock));
        transport.put_value_i32(lock, 0, target);
    }

    /// Claim the bottommost entry. Caller must hold the steal lock.
    ///
    /// Re-fetches the indices under the lock; if an entry is available,
    /// advances the remote `base` and fetches the entry.
    pub fn steal(&self) -> Option<TaskqEntry> {
        let snap = self.snapshot();
        let b = snap.base;
        let t = snap.top;

        if b >= t {
            return None;
        }

        let base_addr = self.header.add(offset_of!(TaskQueue, base));
        self.transport.put_value_i32(base_addr, b + 1, self.target);

        let mut entry = TaskqEntry {
            frame_base: std::ptr::null_mut(),
            frame_size: 0,
            ctx: std::ptr::null_mut(),
        };
        self.transport.get(
            &mut entry as *mut TaskqEntry as *mut u8,
            self.entries
                .add(b as usize * std::mem::size_of::<TaskqEntry>()),
            std::mem::size_of::<TaskqEntry>(),
            self.target,
        );

        tracing::trace!(victim = self.target, base = b, "stole continuation");
        Some(entry)
    }
}
