//! Scheduler unit tests: steal statistics, worker lifecycle, enter guard.

mod taskq;

use std::sync::Arc;

use crate::error::StealFailure;
use crate::runtime::iso_space::IsoSpace;
use crate::runtime::scheduler::{EnterGuard, StealStats, Worker};
use crate::transport::loopback::Loopback;
use crate::util::options::RuntimeOptions;

#[test]
fn test_steal_stats_counts() {
    let mut stats = StealStats::default();
    assert_eq!(stats.attempts(), 0);
    assert_eq!(stats.success_rate(), 1.0);

    stats.record_failure(StealFailure::Aborted);
    stats.record_failure(StealFailure::LockContended);
    stats.record_failure(StealFailure::EmptyRace);
    stats.n_success += 1;

    assert_eq!(stats.n_aborted, 1);
    assert_eq!(stats.n_lock_contended, 1);
    assert_eq!(stats.n_empty_race, 1);
    assert_eq!(stats.attempts(), 4);
    assert!((stats.success_rate() - 0.25).abs() < 1e-9);
}

fn small_options() -> RuntimeOptions {
    RuntimeOptions {
        stack_size: 64 * 1024,
        taskq_capacity: 16,
        future_buf_size: 1024,
        retpool_capacity: 32,
        stack_overflow_detection: false,
    }
}

#[test]
fn test_worker_initialize_finalize() {
    let transport: Arc<Loopback> = Arc::new(Loopback::new());
    let options = small_options();
    let mut ispace = IsoSpace::reserve(&*transport, &options).unwrap();

    let mut worker = Worker::initialize(transport.clone(), &options, &ispace).unwrap();
    assert_eq!(worker.steal_stats().attempts(), 0);
    assert_eq!(worker.max_stack_usage(), 0);

    worker.finalize();
    ispace.release(&*transport);
}

#[test]
fn test_enter_guard_is_exclusive_and_scoped() {
    let transport: Arc<Loopback> = Arc::new(Loopback::new());
    let options = small_options();
    let mut ispace = IsoSpace::reserve(&*transport, &options).unwrap();
    let mut worker = Worker::initialize(transport.clone(), &options, &ispace).unwrap();
    let worker_ptr: *mut Worker = &mut *worker;

    {
        let _guard = EnterGuard::enter(worker_ptr).unwrap();
        // a second enter on the same thread must be rejected
        assert!(EnterGuard::enter(worker_ptr).is_err());
    }
    // the scope cleared the slot
    let guard = EnterGuard::enter(worker_ptr);
    assert!(guard.is_ok());
    drop(guard);

    worker.finalize();
    ispace.release(&*transport);
}
