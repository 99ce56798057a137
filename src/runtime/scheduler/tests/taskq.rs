//! TaskQueue unit tests: owner LIFO discipline, recentering, overflow
//! determinism, and the remote steal protocol driven against our own
//! queue through the transport.

use std::ptr;

use proptest::prelude::*;

use crate::error::Fatal;
use crate::runtime::scheduler::taskq::{RemoteQueue, TaskQueue, TaskqEntry};
use crate::transport::loopback::Loopback;
use crate::transport::{RemotePtr, Transport};

/// Queue placed in transport-shared memory, as the worker does it.
struct Fixture {
    transport: Loopback,
    header_addrs: Vec<RemotePtr>,
    entry_addrs: Vec<RemotePtr>,
}

impl Fixture {
    fn new(capacity: usize) -> Self {
        let transport = Loopback::new();
        let header_addrs = transport
            .malloc_shared(std::mem::size_of::<TaskQueue>())
            .unwrap();
        let entry_addrs = transport
            .malloc_shared(capacity * std::mem::size_of::<TaskqEntry>())
            .unwrap();
        unsafe {
            TaskQueue::init_at(
                header_addrs[0].as_mut_ptr(),
                entry_addrs[0].as_mut_ptr(),
                capacity,
            );
        }
        Self {
            transport,
            header_addrs,
            entry_addrs,
        }
    }

    fn queue(&self) -> &TaskQueue {
        unsafe { &*self.header_addrs[0].as_mut_ptr::<TaskQueue>() }
    }

    fn remote(&self) -> RemoteQueue<'_> {
        RemoteQueue::new(&self.transport, 0, self.header_addrs[0], self.entry_addrs[0])
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        self.transport.free_shared(&self.header_addrs);
        self.transport.free_shared(&self.entry_addrs);
    }
}

/// Synthetic entry; `frame_base` doubles as an identity tag. The queue
/// never dereferences entry fields.
fn entry(tag: usize) -> TaskqEntry {
    TaskqEntry {
        frame_base: tag as *mut u8,
        frame_size: tag,
        ctx: ptr::null_mut(),
    }
}

#[test]
fn test_push_pop_lifo_roundtrip() {
    let fx = Fixture::new(64);
    let q = fx.queue();
    assert!(q.is_empty());

    unsafe {
        q.push(entry(1), &fx.transport).unwrap();
        assert_eq!(q.len(), 1);

        let popped = q.pop().unwrap();
        assert_eq!(popped.frame_base as usize, 1);
        assert_eq!(popped.frame_size, 1);
        assert!(q.is_empty());
    }
}

#[test]
fn test_pop_order_is_lifo() {
    let fx = Fixture::new(64);
    let q = fx.queue();

    unsafe {
        for tag in 1..=5 {
            q.push(entry(tag), &fx.transport).unwrap();
        }
        for tag in (1..=5).rev() {
            assert_eq!(q.pop().unwrap().frame_base as usize, tag);
        }
        assert!(q.pop().is_none());
    }
}

#[test]
fn test_pop_empty_returns_none_and_resets() {
    let fx = Fixture::new(16);
    let q = fx.queue();

    unsafe {
        assert!(q.pop().is_none());
        // the queue stays usable after the reset
        q.push(entry(9), &fx.transport).unwrap();
        assert_eq!(q.pop().unwrap().frame_base as usize, 9);
    }
}

#[test]
fn test_recenter_allows_full_capacity() {
    // starting at the midpoint, pushing `capacity` entries requires the
    // live range to be recentered twice but must succeed
    let fx = Fixture::new(8);
    let q = fx.queue();

    unsafe {
        for tag in 1..=8 {
            q.push(entry(tag), &fx.transport).unwrap();
        }
        assert_eq!(q.len(), 8);
        for tag in (1..=8).rev() {
            assert_eq!(q.pop().unwrap().frame_base as usize, tag);
        }
    }
}

#[test]
fn test_overflow_is_deterministic() {
    // capacity 4 with 10 un-popped pushes: pushes 1..=4 fit, every later
    // push reports overflow instead of corrupting entries
    let fx = Fixture::new(4);
    let q = fx.queue();

    let mut outcomes = Vec::new();
    unsafe {
        for tag in 1..=10 {
            outcomes.push(q.push(entry(tag), &fx.transport));
        }
    }

    assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 4);
    for outcome in &outcomes[4..] {
        assert!(matches!(
            outcome,
            Err(Fatal::TaskQueueOverflow { live: 4, capacity: 4 })
        ));
    }

    // the four resident entries are intact
    unsafe {
        for tag in (1..=4).rev() {
            assert_eq!(q.pop().unwrap().frame_base as usize, tag);
        }
    }
}

#[test]
fn test_steal_takes_bottommost() {
    let fx = Fixture::new(64);
    let q = fx.queue();

    unsafe {
        for tag in 1..=3 {
            q.push(entry(tag), &fx.transport).unwrap();
        }
    }

    let rq = fx.remote();
    assert!(!rq.is_empty());
    assert!(rq.try_lock());
    let stolen = rq.steal().unwrap();
    rq.unlock();
    assert_eq!(stolen.frame_base as usize, 1);

    // the owner still pops the rest in LIFO order
    unsafe {
        assert_eq!(q.pop().unwrap().frame_base as usize, 3);
        assert_eq!(q.pop().unwrap().frame_base as usize, 2);
        assert!(q.pop().is_none());
    }
}

#[test]
fn test_steal_precheck_and_empty_race() {
    let fx = Fixture::new(16);
    let rq = fx.remote();

    // pre-check on an empty queue
    assert!(rq.is_empty());

    // even with the lock held, a steal against an empty queue fails
    assert!(rq.try_lock());
    assert!(rq.steal().is_none());
    rq.unlock();
}

#[test]
fn test_steal_lock_excludes_second_thief() {
    let fx = Fixture::new(16);
    unsafe {
        fx.queue().push(entry(1), &fx.transport).unwrap();
    }

    let rq = fx.remote();
    assert!(rq.try_lock());
    // a second acquisition must fail until release
    assert!(!rq.try_lock());
    rq.unlock();
    assert!(rq.try_lock());
    rq.unlock();
}

#[test]
fn test_steal_then_owner_drain() {
    let fx = Fixture::new(32);
    let q = fx.queue();
    let rq = fx.remote();

    unsafe {
        for tag in 1..=6 {
            q.push(entry(tag), &fx.transport).unwrap();
        }
    }

    // thieves take 1, 2 from the base end
    for expected in 1..=2 {
        assert!(rq.try_lock());
        let stolen = rq.steal().unwrap();
        rq.unlock();
        assert_eq!(stolen.frame_base as usize, expected);
    }

    unsafe {
        for tag in (3..=6).rev() {
            assert_eq!(q.pop().unwrap().frame_base as usize, tag);
        }
        assert!(q.pop().is_none());
    }
}

proptest! {
    /// Owner-side push/pop against a reference stack: any operation
    /// sequence whose live count stays within half the capacity behaves
    /// as a pure LIFO and never reports overflow.
    #[test]
    fn prop_owner_ops_match_reference_stack(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
        let capacity = 32usize;
        let fx = Fixture::new(capacity);
        let q = fx.queue();
        let mut model: Vec<usize> = Vec::new();
        let mut next_tag = 1usize;

        for is_push in ops {
            if is_push {
                if model.len() == capacity / 2 {
                    continue;
                }
                unsafe {
                    q.push(entry(next_tag), &fx.transport).unwrap();
                }
                model.push(next_tag);
                next_tag += 1;
            } else {
                let popped = unsafe { q.pop() };
                match model.pop() {
                    Some(tag) => prop_assert_eq!(popped.unwrap().frame_base as usize, tag),
                    None => prop_assert!(popped.is_none()),
                }
            }
            prop_assert_eq!(q.len(), model.len());
        }
    }
}
