//! Task queue micro-benchmarks: owner push/pop throughput and the steal
//! protocol round trip against our own queue through the transport.

use std::hint::black_box;
use std::ptr;

use criterion::{criterion_group, criterion_main, Criterion};

use isoweave::runtime::scheduler::taskq::{RemoteQueue, TaskQueue, TaskqEntry};
use isoweave::transport::loopback::Loopback;
use isoweave::transport::Transport;

fn entry(tag: usize) -> TaskqEntry {
    TaskqEntry {
        frame_base: tag as *mut u8,
        frame_size: tag,
        ctx: ptr::null_mut(),
    }
}

fn bench_push_pop(c: &mut Criterion) {
    let transport = Loopback::new();
    let headers = transport
        .malloc_shared(std::mem::size_of::<TaskQueue>())
        .unwrap();
    let entries = transport
        .malloc_shared(1024 * std::mem::size_of::<TaskqEntry>())
        .unwrap();
    unsafe {
        TaskQueue::init_at(headers[0].as_mut_ptr(), entries[0].as_mut_ptr(), 1024);
    }
    let q = unsafe { &*headers[0].as_mut_ptr::<TaskQueue>() };

    c.bench_function("taskq_push_pop", |b| {
        b.iter(|| unsafe {
            q.push(entry(1), &transport).unwrap();
            black_box(q.pop());
        })
    });

    c.bench_function("taskq_steal_roundtrip", |b| {
        let rq = RemoteQueue::new(&transport, 0, headers[0], entries[0]);
        b.iter(|| unsafe {
            q.push(entry(1), &transport).unwrap();
            assert!(rq.try_lock());
            black_box(rq.steal());
            rq.unlock();
        })
    });
}

criterion_group!(benches, bench_push_pop);
criterion_main!(benches);
