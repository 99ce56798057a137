//! Distributed futures.
//!
//! A future is a handle to a result slot in its *home* process's
//! [`FuturePool`]. Spawning allocates a slot id from a per-size-class free
//! list and forks a task that fills the slot on completion; touching spins
//! between probing the slot (remotely if the home is another process) and
//! doing one unit of scheduler work.
//!
//! Slot ids are recycled by the consumer. A consumer on the home process
//! pushes the id straight back onto the free list; a remote consumer hands
//! it back through a small distributed return pool owned by the home
//! process and guarded by a distributed spinlock. The home process drains
//! its return pool lazily, when a local free list runs dry.

use std::mem::offset_of;
use std::sync::atomic::{fence, AtomicI32, Ordering};
use std::sync::Arc;

use crate::error::{die, Fatal, InitError};
use crate::transport::{Pid, RemotePtr, Transport};

/// Number of size classes; class `i` holds slots of `1 << i` bytes.
const MAX_ENTRY_BITS: usize = 16;

/// Size class of an allocation: ceil(log2(size)).
#[inline]
fn size_class(size: usize) -> usize {
    debug_assert!(size >= 2);
    (usize::BITS - (size - 1).leading_zeros()) as usize
}

/// A result slot. `done` is written strictly after `value`, and observed
/// with matching acquire ordering, so a reader that sees `done == 1` sees
/// a fully written value.
#[repr(C)]
struct FutureEntry<T> {
    value: T,
    done: i32,
}

/// One-word-per-process distributed spinlock.
///
/// The lock word lives on the process it protects; any process acquires it
/// with a remote fetch-and-add (success iff the prior value was zero) and
/// releases it with a remote store of zero. Contention spins with
/// transport-progress polling; there is no queueing and no backoff.
pub struct DistSpinlock {
    transport: Arc<dyn Transport>,
    locks: Vec<RemotePtr>,
}

impl DistSpinlock {
    /// Collective construction; the lock words start unlocked.
    pub fn new(transport: Arc<dyn Transport>) -> Result<Self, InitError> {
        let locks = transport.malloc_shared(std::mem::size_of::<i32>())?;
        Ok(Self { transport, locks })
    }

    pub fn try_lock(&self, target: Pid) -> bool {
        self.transport.fetch_and_add(self.locks[target], 1, target) == 0
    }

    pub fn lock(&self, target: Pid) {
        while !self.try_lock(target) {
            self.transport.poll();
        }
    }

    pub fn unlock(&self, target: Pid) {
        self.transport.put_value_i32(self.locks[target], 0, target);
    }

    fn finalize(&mut self) {
        if !self.locks.is_empty() {
            self.transport.free_shared(&self.locks);
            self.locks.clear();
        }
    }
}

/// A fixed-capacity pool owned by each process, fillable remotely under a
/// [`DistSpinlock`] and drained locally by the owner.
pub struct DistPool<T: Copy> {
    transport: Arc<dyn Transport>,
    capacity: i32,
    lock: DistSpinlock,
    idxs: Vec<RemotePtr>,
    data: Vec<RemotePtr>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Copy> DistPool<T> {
    /// Collective construction of one pool per process.
    pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Result<Self, InitError> {
        let lock = DistSpinlock::new(transport.clone())?;
        let idxs = transport.malloc_shared(std::mem::size_of::<i32>())?;
        let data = transport.malloc_shared(capacity * std::mem::size_of::<T>())?;
        Ok(Self {
            transport,
            capacity: capacity as i32,
            lock,
            idxs,
            data,
            _marker: std::marker::PhantomData,
        })
    }

    /// Whether `target`'s pool currently holds no entries.
    pub fn is_empty(&self, target: Pid) -> bool {
        let me = self.transport.pid();
        let idx = if target == me {
            // SAFETY: our own index word in shared memory.
            unsafe { AtomicI32::from_ptr(self.idxs[me].as_mut_ptr()).load(Ordering::Relaxed) }
        } else {
            self.transport.get_value_i32(self.idxs[target], target)
        };
        idx == 0
    }

    /// Append `value` to `target`'s pool. Returns false when the pool is
    /// full (the slot index is rolled back).
    pub fn push_remote(&self, value: T, target: Pid) -> bool {
        self.lock.lock(target);

        let idx = self.transport.fetch_and_add(self.idxs[target], 1, target);

        let success = if idx < self.capacity {
            let slot = self
                .data[target]
                .add(idx as usize * std::mem::size_of::<T>());
            self.transport.put(
                slot,
                &value as *const T as *const u8,
                std::mem::size_of::<T>(),
                target,
            );
            true
        } else {
            self.transport.put_value_i32(self.idxs[target], idx, target);
            false
        };

        self.lock.unlock(target);
        success
    }

    /// Drain every entry of the local pool under the lock.
    pub fn drain_local(&self, mut consume: impl FnMut(T)) {
        let me = self.transport.pid();
        self.lock.lock(me);

        // SAFETY: our own pool memory; the lock excludes remote pushers.
        unsafe {
            let idx_ptr = self.idxs[me].as_mut_ptr::<i32>();
            let mut idx = AtomicI32::from_ptr(idx_ptr).load(Ordering::Relaxed);
            while idx > 0 {
                idx -= 1;
                let slot = self.data[me].as_mut_ptr::<T>().add(idx as usize);
                consume(slot.read());
                AtomicI32::from_ptr(idx_ptr).store(idx, Ordering::Relaxed);
            }
        }

        self.lock.unlock(me);
    }

    fn finalize(&mut self) {
        if !self.idxs.is_empty() {
            self.transport.free_shared(&self.idxs);
            self.transport.free_shared(&self.data);
            self.idxs.clear();
            self.data.clear();
        }
        self.lock.finalize();
    }
}

/// An id handed back by a remote consumer: which slot, and how wide its
/// size class is.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct RetEntry {
    id: i32,
    size: i32,
}

/// Per-process pool of result slots.
///
/// Slot ids are byte offsets into a per-process arena shared through the
/// transport. Ids are reused through per-size-class free lists; the arena
/// grows monotonically when a free list is empty and overflow is fatal.
pub struct FuturePool {
    transport: Arc<dyn Transport>,
    /// Arena bump pointer (byte offset of the next fresh slot).
    ptr: i32,
    buf_size: i32,
    /// Per-pid arena base addresses.
    bufs: Vec<RemotePtr>,
    /// Free ids, bucketed by size class.
    id_pools: Vec<Vec<i32>>,
    /// Ids coming home from remote consumers.
    retpool: DistPool<RetEntry>,
    retpool_capacity: usize,
}

impl FuturePool {
    /// Collective construction.
    pub fn new(
        transport: Arc<dyn Transport>,
        buf_size: usize,
        retpool_capacity: usize,
    ) -> Result<Self, InitError> {
        let bufs = transport.malloc_shared(buf_size)?;
        let retpool = DistPool::new(transport.clone(), retpool_capacity)?;
        Ok(Self {
            transport,
            ptr: 0,
            buf_size: buf_size as i32,
            bufs,
            id_pools: vec![Vec::new(); MAX_ENTRY_BITS],
            retpool,
            retpool_capacity,
        })
    }

    /// Allocate a slot id for a `T`-typed result.
    ///
    /// Free list first; then the return pool is drained if it has entries;
    /// then the arena grows. Arena exhaustion is fatal to the caller.
    pub fn acquire<T: Copy>(&mut self) -> Result<i32, Fatal> {
        let entry_size = std::mem::size_of::<FutureEntry<T>>();
        debug_assert!(std::mem::align_of::<FutureEntry<T>>() <= 8);
        let class = size_class(entry_size);
        let real_size = 1i32 << class;

        let me = self.transport.pid();
        if !self.retpool.is_empty(me) {
            self.drain_returned();
        }

        if let Some(id) = self.id_pools[class].pop() {
            self.reset::<T>(id);
            return Ok(id);
        }

        if self.ptr + real_size < self.buf_size {
            let id = self.ptr;
            self.ptr += real_size;
            return Ok(id);
        }

        Err(Fatal::FuturePoolOverflow {
            used: self.ptr as usize,
            capacity: self.buf_size as usize,
            requested: real_size as usize,
        })
    }

    /// Write `value` into slot `id` of process `home` and mark it done.
    /// The value write is ordered before the done write so any reader that
    /// observes `done == 1` reads a fully written value.
    pub fn fill<T: Copy>(&mut self, id: i32, home: Pid, value: T) {
        let me = self.transport.pid();
        let slot = self.bufs[home].add(id as usize);

        if home == me {
            // SAFETY: slot `id` of our own arena, sized for FutureEntry<T>.
            unsafe {
                let entry = slot.as_mut_ptr::<FutureEntry<T>>();
                std::ptr::addr_of_mut!((*entry).value).write(value);
                fence(Ordering::Release);
                AtomicI32::from_ptr(std::ptr::addr_of_mut!((*entry).done)).store(1, Ordering::Relaxed);
            }
        } else {
            self.transport.put(
                slot,
                &value as *const T as *const u8,
                std::mem::size_of::<T>(),
                home,
            );
            self.transport.put_value_i32(
                slot.add(offset_of!(FutureEntry<T>, done)),
                1,
                home,
            );
        }

        tracing::trace!(id, home, "future filled");
    }

    /// Probe slot `id` of process `home` once. On completion, reads the
    /// value, recycles the id (locally or through the return pool), and
    /// returns the value.
    pub fn try_complete<T: Copy>(&mut self, id: i32, home: Pid) -> Option<T> {
        let me = self.transport.pid();
        let slot = self.bufs[home].add(id as usize);
        debug_assert!(id >= 0 && id < self.buf_size);

        if home == me {
            // SAFETY: slot `id` of our own arena.
            unsafe {
                let entry = slot.as_mut_ptr::<FutureEntry<T>>();
                let done =
                    AtomicI32::from_ptr(std::ptr::addr_of_mut!((*entry).done)).load(Ordering::Relaxed);
                if done == 0 {
                    return None;
                }
                fence(Ordering::Acquire);
                let value = std::ptr::addr_of!((*entry).value).read();

                let class = size_class(std::mem::size_of::<FutureEntry<T>>());
                self.id_pools[class].push(id);

                Some(value)
            }
        } else {
            let done = self
                .transport
                .get_value_i32(slot.add(offset_of!(FutureEntry<T>, done)), home);
            if done == 0 {
                return None;
            }

            let mut value = std::mem::MaybeUninit::<T>::uninit();
            self.transport.get(
                value.as_mut_ptr() as *mut u8,
                slot,
                std::mem::size_of::<T>(),
                home,
            );

            // hand the id back to its home process
            let entry_size = std::mem::size_of::<FutureEntry<T>>() as i32;
            let ret = RetEntry {
                id,
                size: entry_size,
            };
            if !self.retpool.push_remote(ret, home) {
                die(Fatal::ReturnPoolOverflow {
                    capacity: self.retpool_capacity,
                });
            }

            // SAFETY: fully written by the filler before done was set.
            Some(unsafe { value.assume_init() })
        }
    }

    /// Move ids from the return pool back into the local free lists.
    fn drain_returned(&mut self) {
        let id_pools = &mut self.id_pools;
        let mut count = 0usize;
        self.retpool.drain_local(|entry: RetEntry| {
            let class = size_class(entry.size as usize);
            id_pools[class].push(entry.id);
            count += 1;
        });
        tracing::trace!(count, "drained returned future ids");
    }

    /// Clear the done flag of a reused slot.
    fn reset<T>(&mut self, id: i32) {
        let me = self.transport.pid();
        let slot = self.bufs[me].add(id as usize);
        // SAFETY: slot `id` of our own arena.
        unsafe {
            let entry = slot.as_mut_ptr::<FutureEntry<T>>();
            AtomicI32::from_ptr(std::ptr::addr_of_mut!((*entry).done)).store(0, Ordering::Relaxed);
        }
    }

    /// Collective teardown.
    pub fn finalize(&mut self) {
        if !self.bufs.is_empty() {
            self.transport.free_shared(&self.bufs);
            self.bufs.clear();
        }
        for pool in &mut self.id_pools {
            pool.clear();
        }
        self.retpool.finalize();
        self.ptr = 0;
        self.buf_size = 0;
    }
}

/// Handle to the result of a spawned task.
///
/// A plain value: `{slot id, home pid}`. Copying the handle does not
/// duplicate the result; the slot is logically owned by one `(home, id)`
/// pair until the consumer recycles it at `touch`.
pub struct Future<T> {
    id: i32,
    home: Pid,
    _marker: std::marker::PhantomData<T>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Future<T> {}

impl<T: Copy + Send + 'static> Future<T> {
    /// Spawn `f` as a new task; its result fills this future's slot.
    ///
    /// The slot id is allocated on the calling process, which becomes the
    /// future's home. The task itself may complete on any process; `fill`
    /// writes home with one-sided operations in that case.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        // SAFETY: spawn is called from task context (inside Process::start).
        unsafe {
            let w = crate::runtime::scheduler::current();
            let id = match (*w).fpool.acquire::<T>() {
                Ok(id) => id,
                Err(fatal) => die(fatal),
            };
            let home = (*w).transport().pid();

            crate::runtime::scheduler::fork(move || {
                let value = f();
                // the frame may have been stolen: re-resolve the worker
                // SAFETY: task bodies always run in task context.
                unsafe {
                    let w = crate::runtime::scheduler::current();
                    (*w).fpool.fill(id, home, value);
                }
            });

            Self {
                id,
                home,
                _marker: std::marker::PhantomData,
            }
        }
    }

    /// Join: spin until the slot is filled, alternating between probing
    /// and one unit of scheduler work, then recycle the id and return the
    /// value.
    pub fn touch(self) -> T {
        // SAFETY: touch is called from task context.
        unsafe {
            loop {
                let w = crate::runtime::scheduler::current();
                if let Some(value) = (*w).fpool.try_complete::<T>(self.id, self.home) {
                    return value;
                }
                crate::runtime::scheduler::do_scheduler_work(w);
            }
        }
    }
}

impl<T> std::fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Future")
            .field("id", &self.id)
            .field("home", &self.home)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::Loopback;

    fn pool() -> FuturePool {
        FuturePool::new(Arc::new(Loopback::new()), 4096, 64).unwrap()
    }

    #[test]
    fn test_size_class() {
        assert_eq!(size_class(2), 1);
        assert_eq!(size_class(8), 3);
        assert_eq!(size_class(9), 4);
        assert_eq!(size_class(16), 4);
        assert_eq!(size_class(17), 5);
    }

    #[test]
    fn test_fill_then_complete_local() {
        let mut pool = pool();
        let id = pool.acquire::<i64>().unwrap();

        assert!(pool.try_complete::<i64>(id, 0).is_none());
        pool.fill(id, 0, 12345i64);
        assert_eq!(pool.try_complete::<i64>(id, 0), Some(12345));

        pool.finalize();
    }

    #[test]
    fn test_id_recycled_after_touch() {
        let mut pool = pool();
        let id = pool.acquire::<i64>().unwrap();
        pool.fill(id, 0, 1i64);
        assert_eq!(pool.try_complete::<i64>(id, 0), Some(1));

        // same size class reuses the recycled id, with a cleared slot
        let id2 = pool.acquire::<i64>().unwrap();
        assert_eq!(id2, id);
        assert!(pool.try_complete::<i64>(id2, 0).is_none());

        pool.finalize();
    }

    #[test]
    fn test_distinct_size_classes_do_not_collide() {
        let mut pool = pool();
        let a = pool.acquire::<i64>().unwrap();
        let b = pool.acquire::<[u64; 4]>().unwrap();
        assert_ne!(a, b);

        pool.fill(a, 0, -7i64);
        pool.fill(b, 0, [1u64, 2, 3, 4]);

        assert_eq!(pool.try_complete::<i64>(a, 0), Some(-7));
        assert_eq!(pool.try_complete::<[u64; 4]>(b, 0), Some([1, 2, 3, 4]));

        pool.finalize();
    }

    #[test]
    fn test_arena_overflow_is_reported() {
        let mut pool = FuturePool::new(Arc::new(Loopback::new()), 64, 16).unwrap();
        // each i64 slot takes a 16-byte class; a 64-byte arena fits three
        // before the bump pointer hits the end
        let mut last = Ok(0);
        for _ in 0..8 {
            last = pool.acquire::<i64>();
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(Fatal::FuturePoolOverflow { .. })));
        pool.finalize();
    }
}
