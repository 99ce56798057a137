//! Protocol-level tests across logical processes (shmem transport).
//!
//! These drive the distributed components — steal protocol, distributed
//! spinlock, future return pool — from multiple threads, each acting as
//! one process. Stack migration itself needs a congruent iso-address
//! range and is exercised by the single-process suite.

use std::mem::size_of;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;

use isoweave::runtime::future::{DistPool, DistSpinlock, FuturePool};
use isoweave::runtime::scheduler::taskq::{RemoteQueue, TaskQueue, TaskqEntry};
use isoweave::transport::shmem::ShmemGroup;
use isoweave::transport::Transport;

fn entry(tag: usize) -> TaskqEntry {
    TaskqEntry {
        frame_base: tag as *mut u8,
        frame_size: tag,
        ctx: ptr::null_mut(),
    }
}

/// Owner-pop racing a remote thief over a queue holding exactly one
/// entry: exactly one side claims it, on every randomized interleaving.
#[test]
fn test_owner_pop_vs_steal_mutual_exclusion() {
    const ROUNDS: usize = 300;

    let transports = ShmemGroup::create(2);
    let owner_claims = AtomicUsize::new(0);
    let thief_claims = AtomicUsize::new(0);

    thread::scope(|s| {
        let owner_claims = &owner_claims;
        let thief_claims = &thief_claims;
        let t0 = transports[0].clone();
        let t1 = transports[1].clone();

        // pid 0: queue owner
        s.spawn(move || {
            let headers = t0.malloc_shared(size_of::<TaskQueue>()).unwrap();
            let entries = t0.malloc_shared(64 * size_of::<TaskqEntry>()).unwrap();
            let q = unsafe {
                TaskQueue::init_at(headers[0].as_mut_ptr(), entries[0].as_mut_ptr(), 64);
                &*headers[0].as_mut_ptr::<TaskQueue>()
            };
            let mut rng = rand::rng();

            for round in 0..ROUNDS {
                unsafe {
                    q.push(entry(round + 1), t0.as_ref()).unwrap();
                }
                t0.barrier();

                for _ in 0..rng.random_range(0..30) {
                    std::hint::spin_loop();
                }
                if let Some(e) = unsafe { q.pop() } {
                    assert_eq!(e.frame_base as usize, round + 1);
                    owner_claims.fetch_add(1, Ordering::SeqCst);
                }

                // both sides settle before the next round
                t0.barrier();
            }
            t0.barrier();
            t0.free_shared(&headers);
            t0.free_shared(&entries);
        });

        // pid 1: thief
        s.spawn(move || {
            let headers = t1.malloc_shared(size_of::<TaskQueue>()).unwrap();
            let entries = t1.malloc_shared(64 * size_of::<TaskqEntry>()).unwrap();
            let mut rng = rand::rng();

            for round in 0..ROUNDS {
                t1.barrier();

                for _ in 0..rng.random_range(0..30) {
                    std::hint::spin_loop();
                }
                let rq = RemoteQueue::new(t1.as_ref(), 0, headers[0], entries[0]);
                if !rq.is_empty() && rq.try_lock() {
                    if let Some(e) = rq.steal() {
                        assert_eq!(e.frame_base as usize, round + 1);
                        thief_claims.fetch_add(1, Ordering::SeqCst);
                    }
                    rq.unlock();
                }

                t1.barrier();
            }
            t1.barrier();
            t1.free_shared(&headers);
            t1.free_shared(&entries);
        });
    });

    let owner = owner_claims.load(Ordering::SeqCst);
    let thief = thief_claims.load(Ordering::SeqCst);
    assert_eq!(
        owner + thief,
        ROUNDS,
        "every entry claimed exactly once (owner {owner}, thief {thief})"
    );
}

/// A stolen entry crosses the wire intact.
#[test]
fn test_steal_transfers_entry_bytes_intact() {
    let transports = ShmemGroup::create(2);

    thread::scope(|s| {
        let t0 = transports[0].clone();
        let t1 = transports[1].clone();

        s.spawn(move || {
            let headers = t0.malloc_shared(size_of::<TaskQueue>()).unwrap();
            let entries = t0.malloc_shared(32 * size_of::<TaskqEntry>()).unwrap();
            let q = unsafe {
                TaskQueue::init_at(headers[0].as_mut_ptr(), entries[0].as_mut_ptr(), 32);
                &*headers[0].as_mut_ptr::<TaskQueue>()
            };

            unsafe {
                q.push(
                    TaskqEntry {
                        frame_base: 0xdead_b000 as *mut u8,
                        frame_size: 4096,
                        ctx: 0xdead_b040 as *mut _,
                    },
                    t0.as_ref(),
                )
                .unwrap();
            }
            t0.barrier(); // entry available
            t0.barrier(); // thief done
            t0.free_shared(&headers);
            t0.free_shared(&entries);
        });

        s.spawn(move || {
            let headers = t1.malloc_shared(size_of::<TaskQueue>()).unwrap();
            let entries = t1.malloc_shared(32 * size_of::<TaskqEntry>()).unwrap();
            t1.barrier();

            let rq = RemoteQueue::new(t1.as_ref(), 0, headers[0], entries[0]);
            assert!(!rq.is_empty());
            assert!(rq.try_lock());
            let stolen = rq.steal().expect("entry must be available");
            rq.unlock();

            assert_eq!(stolen.frame_base as usize, 0xdead_b000);
            assert_eq!(stolen.frame_size, 4096);
            assert_eq!(stolen.ctx as usize, 0xdead_b040);

            t1.barrier();
            t1.free_shared(&headers);
            t1.free_shared(&entries);
        });
    });
}

/// Remote fill: the consumer observes done only after the value, and the
/// value arrives untorn.
#[test]
fn test_future_fill_from_remote_process() {
    let transports = ShmemGroup::create(2);
    let slot_id = AtomicI32::new(-1);

    thread::scope(|s| {
        let t0 = transports[0].clone();
        let t1 = transports[1].clone();
        let slot_id = &slot_id;

        // pid 0: home of the future, consumer
        s.spawn(move || {
            let mut pool =
                FuturePool::new(t0.clone() as Arc<dyn Transport>, 4096, 64).unwrap();
            let id = pool.acquire::<u64>().unwrap();
            slot_id.store(id, Ordering::SeqCst);
            t0.barrier();

            // spin like touch() does, without a scheduler
            let value = loop {
                if let Some(v) = pool.try_complete::<u64>(id, 0) {
                    break v;
                }
                t0.poll();
            };
            assert_eq!(value, 0x1122_3344_5566_7788);

            t0.barrier();
            pool.finalize();
        });

        // pid 1: remote filler
        s.spawn(move || {
            let mut pool =
                FuturePool::new(t1.clone() as Arc<dyn Transport>, 4096, 64).unwrap();
            t1.barrier();

            let id = slot_id.load(Ordering::SeqCst);
            assert!(id >= 0);
            pool.fill(id, 0, 0x1122_3344_5566_7788u64);

            t1.barrier();
            pool.finalize();
        });
    });
}

/// Cross-process id recycling: a remote consumer hands the id back
/// through the return pool and the home process reuses it once its free
/// list runs dry.
#[test]
fn test_future_id_returns_home_through_return_pool() {
    let transports = ShmemGroup::create(2);
    let slot_id = AtomicI32::new(-1);

    thread::scope(|s| {
        let t0 = transports[0].clone();
        let t1 = transports[1].clone();
        let slot_id = &slot_id;

        // pid 0: home process
        s.spawn(move || {
            let mut pool =
                FuturePool::new(t0.clone() as Arc<dyn Transport>, 4096, 64).unwrap();

            let id = pool.acquire::<u64>().unwrap();
            slot_id.store(id, Ordering::SeqCst);
            pool.fill(id, 0, 7u64);
            t0.barrier(); // slot filled

            t0.barrier(); // consumer recycled remotely

            // the local free list for this class is empty, so acquire
            // drains the return pool and reuses the id that came home
            let id2 = pool.acquire::<u64>().unwrap();
            assert_eq!(id2, id);
            // the reused slot is clean
            assert!(pool.try_complete::<u64>(id2, 0).is_none());

            t0.barrier();
            pool.finalize();
        });

        // pid 1: remote consumer
        s.spawn(move || {
            let mut pool =
                FuturePool::new(t1.clone() as Arc<dyn Transport>, 4096, 64).unwrap();
            t1.barrier();

            let id = slot_id.load(Ordering::SeqCst);
            let value = pool
                .try_complete::<u64>(id, 0)
                .expect("slot was filled before the barrier");
            assert_eq!(value, 7);

            t1.barrier();
            t1.barrier();
            pool.finalize();
        });
    });
}

/// The distributed spinlock serializes critical sections across
/// processes. Every participant's lock object shares the same collective
/// lock-word allocation.
#[test]
fn test_dist_spinlock_mutual_exclusion() {
    const ITERS: usize = 200;

    let transports = ShmemGroup::create(3);
    let in_critical = AtomicUsize::new(0);
    let total = AtomicUsize::new(0);

    thread::scope(|s| {
        for t in &transports {
            let t = t.clone();
            let in_critical = &in_critical;
            let total = &total;
            s.spawn(move || {
                let lock = DistSpinlock::new(t.clone() as Arc<dyn Transport>).unwrap();
                t.barrier();

                for _ in 0..ITERS {
                    lock.lock(0);
                    assert_eq!(in_critical.fetch_add(1, Ordering::SeqCst), 0);
                    std::hint::spin_loop();
                    assert_eq!(in_critical.fetch_sub(1, Ordering::SeqCst), 1);
                    total.fetch_add(1, Ordering::SeqCst);
                    lock.unlock(0);
                }

                t.barrier();
            });
        }
    });

    assert_eq!(total.load(Ordering::SeqCst), 3 * ITERS);
}

/// The distributed pool accepts pushes up to capacity and reports a full
/// pool instead of corrupting entries.
#[test]
fn test_dist_pool_capacity_bound() {
    let transports = ShmemGroup::create(2);

    thread::scope(|s| {
        let t0 = transports[0].clone();
        let t1 = transports[1].clone();

        s.spawn(move || {
            let pool: DistPool<i64> =
                DistPool::new(t0.clone() as Arc<dyn Transport>, 4).unwrap();
            t0.barrier(); // peer done pushing

            let mut drained = Vec::new();
            pool.drain_local(|v| drained.push(v));
            drained.sort_unstable();
            assert_eq!(drained, vec![10, 11, 12, 13]);
            assert!(pool.is_empty(0));

            t0.barrier();
        });

        s.spawn(move || {
            let pool: DistPool<i64> =
                DistPool::new(t1.clone() as Arc<dyn Transport>, 4).unwrap();

            for i in 0..4 {
                assert!(pool.push_remote(10 + i, 0), "pool has room");
            }
            assert!(!pool.push_remote(99, 0), "full pool rejects the push");

            t1.barrier();
            t1.barrier();
        });
    });
}
