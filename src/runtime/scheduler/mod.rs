//! The per-process worker and scheduling loop.
//!
//! Exactly one worker drives each process. There is no OS-thread
//! parallelism inside the runtime: a task runs until it forks, touches a
//! future, or returns, and every suspension point is explicit.
//!
//! Scheduling entry happens when a task completes or before a fork. The
//! loop, in order:
//!
//! 1. pop the local queue and resume the parent continuation (its frame is
//!    still on this stack: cheap register restore);
//! 2. else resume the main task if it is resident and we are not it;
//! 3. else attempt one steal from a uniformly random victim; on success
//!    fetch the frame image into the congruent local range and resume it;
//! 4. else resume the front of the wait queue (a previously packed
//!    continuation, written back byte-for-byte);
//! 5. else poll the transport and let the caller retry.
//!
//! Steal failures (empty pre-check, lock contention, post-lock empty race)
//! are never fatal and carry no memory: the next entry picks a fresh
//! random victim.

pub mod taskq;

#[cfg(test)]
mod tests;

use std::cell::Cell;
use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::Arc;

use rand::Rng;

use crate::error::{die, StealFailure};
use crate::runtime::context::{
    call_on_new_stack, current_stack_pointer, execute_on_stack, pack_context, resume_context,
    save_context_with_call, Context, SavedContext, MAX_FRAME_SIZE, RED_ZONE,
};
use crate::runtime::future::FuturePool;
use crate::runtime::iso_space::IsoSpace;
use crate::transport::{Pid, RemotePtr, Transport};
use crate::util::options::RuntimeOptions;

use taskq::{RemoteQueue, TaskQueue, TaskqEntry};

pub use taskq::TaskqSnapshot;

/// Steal attempt outcome counters, kept per worker for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct StealStats {
    /// Pre-check snapshot showed an empty victim queue.
    pub n_aborted: u64,
    /// The victim's steal lock was held.
    pub n_lock_contended: u64,
    /// The queue drained between pre-check and lock acquisition.
    pub n_empty_race: u64,
    /// Entries actually claimed.
    pub n_success: u64,
}

impl StealStats {
    #[inline]
    fn record_failure(&mut self, failure: StealFailure) {
        match failure {
            StealFailure::Aborted => self.n_aborted += 1,
            StealFailure::LockContended => self.n_lock_contended += 1,
            StealFailure::EmptyRace => self.n_empty_race += 1,
        }
    }

    /// Total attempts, successful or not.
    pub fn attempts(&self) -> u64 {
        self.n_aborted + self.n_lock_contended + self.n_empty_race + self.n_success
    }

    /// Fraction of attempts that claimed an entry.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.attempts();
        if attempts == 0 {
            return 1.0;
        }
        self.n_success as f64 / attempts as f64
    }
}

/// The per-process scheduling state.
///
/// Owned by the `Process`; reached from task context through the scoped
/// thread-local installed by the enter guard, never through a global.
pub struct Worker {
    transport: Arc<dyn Transport>,
    pub(crate) fpool: FuturePool,

    /// Context of the innermost suspendable point of the running task.
    parent_ctx: *mut Context,
    /// Whether the running task is the main task.
    is_main_task: bool,
    /// The main task's context while its frames are resident on this
    /// process's stack and it is not running.
    main_ctx: *mut Context,

    /// Own queue header (placement-initialized in shared memory).
    taskq: *mut TaskQueue,
    /// Per-pid queue header addresses.
    taskq_addrs: Vec<RemotePtr>,
    /// Per-pid entry array addresses.
    entry_addrs: Vec<RemotePtr>,

    /// Packed continuations awaiting resume, oldest first.
    waitq: VecDeque<*mut SavedContext>,

    stats: StealStats,

    stack_bottom: *mut u8,
    max_stack_usage: usize,
    iso_low_watermark: *mut u8,
    iso_size: usize,
}

impl Worker {
    /// Collective construction of the per-process worker state.
    pub(crate) fn initialize(
        transport: Arc<dyn Transport>,
        options: &RuntimeOptions,
        ispace: &IsoSpace,
    ) -> Result<Box<Worker>, crate::error::InitError> {
        let capacity = options.taskq_capacity;

        let taskq_addrs = transport.malloc_shared(std::mem::size_of::<TaskQueue>())?;
        let entry_addrs =
            transport.malloc_shared(capacity * std::mem::size_of::<TaskqEntry>())?;

        let me = transport.pid();
        let taskq = taskq_addrs[me].as_mut_ptr::<TaskQueue>();
        // SAFETY: freshly allocated zeroed shared chunks of the right size.
        unsafe {
            TaskQueue::init_at(taskq, entry_addrs[me].as_mut_ptr(), capacity);
        }

        let fpool = FuturePool::new(
            transport.clone(),
            options.future_buf_size,
            options.retpool_capacity,
        )?;

        tracing::debug!(
            pid = me,
            n_procs = transport.n_procs(),
            taskq_capacity = capacity,
            "worker initialized"
        );

        Ok(Box::new(Worker {
            transport,
            fpool,
            parent_ctx: ptr::null_mut(),
            is_main_task: false,
            main_ctx: ptr::null_mut(),
            taskq,
            taskq_addrs,
            entry_addrs,
            waitq: VecDeque::new(),
            stats: StealStats::default(),
            stack_bottom: ptr::null_mut(),
            max_stack_usage: 0,
            iso_low_watermark: ispace.low_watermark(),
            iso_size: ispace.stack_size(),
        }))
    }

    /// Collective teardown; frees the shared queue memory.
    pub(crate) fn finalize(&mut self) {
        debug_assert!(self.waitq.is_empty());
        self.fpool.finalize();
        if !self.taskq_addrs.is_empty() {
            self.transport.free_shared(&self.taskq_addrs);
            self.transport.free_shared(&self.entry_addrs);
            self.taskq_addrs.clear();
            self.entry_addrs.clear();
        }
        self.taskq = ptr::null_mut();
    }

    #[inline]
    pub(crate) fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Steal outcome counters.
    pub fn steal_stats(&self) -> &StealStats {
        &self.stats
    }

    /// High-water mark of iso-address stack usage, in bytes.
    pub fn max_stack_usage(&self) -> usize {
        self.max_stack_usage
    }
}

thread_local! {
    static CURRENT_WORKER: Cell<*mut Worker> = const { Cell::new(ptr::null_mut()) };
}

/// Scoped installation of the worker as this thread's current worker,
/// cleared on drop. One level only: entering twice is a caller bug.
pub(crate) struct EnterGuard;

impl EnterGuard {
    pub(crate) fn enter(worker: *mut Worker) -> Result<Self, crate::error::InitError> {
        if !CURRENT_WORKER.get().is_null() {
            return Err(crate::error::InitError::AlreadyEntered);
        }
        CURRENT_WORKER.set(worker);
        Ok(Self)
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        CURRENT_WORKER.set(ptr::null_mut());
    }
}

/// The current worker.
///
/// Task code must re-resolve this after every suspension point: a frame
/// that migrated resumes on a different process, whose own worker answers
/// here.
pub(crate) fn current() -> *mut Worker {
    let w = CURRENT_WORKER.get();
    assert!(
        !w.is_null(),
        "no isoweave runtime entered on this thread (call Process::start)"
    );
    w
}

/// Fork: turn the current frame into a stealable continuation and run `f`
/// as a new task in its place.
///
/// When `f` completes, the worker pops its own queue; if the continuation
/// is still there (not stolen), fork returns normally into it. Otherwise
/// the parent is gone — main, stolen, or suspended — and control enters
/// the scheduling loop, never returning to this frame on this process.
///
/// # Safety
/// Must run in task context on the iso-address stack.
pub(crate) unsafe fn fork<F: FnOnce()>(f: F) {
    let w = current();
    let prev_ctx = (*w).parent_ctx;
    debug_assert!(!prev_ctx.is_null());

    let mut f = ManuallyDrop::new(f);
    save_context_with_call(
        prev_ctx,
        fork_handler::<F>,
        &mut f as *mut ManuallyDrop<F> as *mut u8,
        ptr::null_mut(),
    );

    // resumed here, possibly on another process
    let w = current();
    (*w).parent_ctx = prev_ctx;
}

unsafe extern "C" fn fork_handler<F: FnOnce()>(ctx: *mut Context, f_ptr: *mut u8, _arg1: *mut u8) {
    // move the task body out of the parent frame before anything can
    // migrate it
    let f = ptr::read(f_ptr as *mut F);

    let w = current();

    if (ctx as *mut u8) < (*w).iso_low_watermark {
        die(crate::error::Fatal::IsoStackExhausted {
            used: (*w).iso_low_watermark as usize + (*w).iso_size - ctx as usize,
            total: (*w).iso_size,
        });
    }

    if (*w).is_main_task {
        // the main task must never be stolen by another process, so it is
        // registered on the worker instead of the queue
        (*w).main_ctx = ctx;
        (*w).is_main_task = false;
    } else {
        let entry = TaskqEntry {
            frame_base: (*ctx).top_ptr(),
            frame_size: (*ctx).stack_size(),
            ctx,
        };
        entry.debug_validate();
        debug_assert!(entry.frame_size < MAX_FRAME_SIZE);

        if let Err(fatal) = (*(*w).taskq).push(entry, &**(*w).transport()) {
            die(fatal);
        }
    }

    (*w).transport.poll();

    // stack usage high-water mark
    let sp = current_stack_pointer();
    let usage = (*w).stack_bottom as usize - sp as usize;
    if usage > (*w).max_stack_usage {
        (*w).max_stack_usage = usage;
    }

    (*w).parent_ctx = ctx;

    // run the child task
    f();

    // the frame may have been stolen while the child ran: resolve the
    // worker again before touching it
    let w = current();

    match (*(*w).taskq).pop() {
        Some(entry) => {
            // the continuation was not stolen: fall through and return
            // into it normally
            debug_assert_eq!(entry.ctx, ctx);
            debug_assert_eq!(entry.frame_base, (*ctx).top_ptr());
            (*w).parent_ctx = (*ctx).parent;
        }
        None => {
            // parent is main, stolen, or suspended: enter the scheduler
            go(w)
        }
    }
}

/// Suspend: pack the current task into a heap snapshot and run `g` with
/// it. `g` must transfer control away (it never returns); the packed task
/// continues when some resume copies its bytes back.
///
/// # Safety
/// Must run in task context on the iso-address stack.
pub(crate) unsafe fn suspend<G: FnOnce(*mut SavedContext)>(g: G) {
    let w = current();
    let prev_ctx = (*w).parent_ctx;

    let mut g = ManuallyDrop::new(g);
    save_context_with_call(
        prev_ctx,
        suspend_handler::<G>,
        &mut g as *mut ManuallyDrop<G> as *mut u8,
        ptr::null_mut(),
    );

    let w = current();
    (*w).parent_ctx = prev_ctx;
}

unsafe extern "C" fn suspend_handler<G: FnOnce(*mut SavedContext)>(
    ctx: *mut Context,
    g_ptr: *mut u8,
    _arg1: *mut u8,
) {
    let w = current();
    let sctx = pack_context(ctx, (*w).is_main_task);
    (*w).parent_ctx = ctx;

    let g = ptr::read(g_ptr as *mut G);
    g(sctx);

    unreachable!("suspend continuation returned");
}

/// Enter the scheduler after the current task's frames were abandoned.
/// Resumes the main task if its frames are resident, otherwise the oldest
/// packed continuation.
pub(crate) unsafe fn go(w: *mut Worker) -> ! {
    if !(*w).is_main_task && !(*w).main_ctx.is_null() {
        (*w).is_main_task = true;
        tracing::trace!("resuming the main task");
        resume_context((*w).main_ctx)
    } else if let Some(next) = (*w).waitq.pop_front() {
        tracing::trace!("resuming a waiting task");
        resume_saved(ptr::null_mut(), next)
    } else {
        unreachable!("scheduler has no resumable continuation");
    }
}

/// Resume flavor (b): write a packed continuation back into the
/// iso-address range it claims and return into it. `prev` (nullable) is
/// the snapshot of the task that just suspended, parked on the wait queue.
unsafe fn resume_saved(prev: *mut SavedContext, next: *mut SavedContext) -> ! {
    let w = current();
    if !prev.is_null() {
        (*w).waitq.push_back(prev);
    }
    (*w).is_main_task = (*next).is_main_task;

    // run below the range about to be overwritten
    let stack_ptr = (*next).sp.sub(RED_ZONE);
    execute_on_stack(
        do_resume_saved,
        next as *mut u8,
        ptr::null_mut(),
        ptr::null_mut(),
        ptr::null_mut(),
        stack_ptr,
    )
}

unsafe extern "C" fn do_resume_saved(p0: *mut u8, _p1: *mut u8, _p2: *mut u8, _p3: *mut u8) {
    let sctx = Box::from_raw(p0 as *mut SavedContext);
    let ctx = sctx.ctx;

    ptr::copy_nonoverlapping(sctx.stack.as_ptr(), sctx.stack_top, sctx.stack.len());

    debug_assert_eq!(sctx.ip, (*ctx).instr_ptr());
    debug_assert_eq!(sctx.sp, (*ctx).stack_ptr());

    tracing::trace!(
        frame_base = ?sctx.stack_top,
        frame_size = sctx.stack.len(),
        "resuming a packed frame"
    );

    // exactly-once consumption of the heap snapshot
    drop(sctx);

    resume_context(ctx)
}

/// Everything resume flavor (c) needs after the stack switch, passed as
/// one POD so it can be copied out before the frame fetch clobbers the
/// suspended frames.
#[repr(C)]
#[derive(Clone, Copy)]
struct StolenArg {
    entry: TaskqEntry,
    victim: Pid,
    victim_header: RemotePtr,
}

/// Resume flavor (c): fetch a stolen continuation's frame image from the
/// victim into the congruent local range and return into it.
unsafe fn resume_stolen(prev: *mut SavedContext, arg: *mut StolenArg) -> ! {
    let w = current();
    (*w).waitq.push_back(prev);
    (*w).is_main_task = false;

    let frame_base = (*arg).entry.frame_base;
    execute_on_stack(
        do_resume_stolen,
        arg as *mut u8,
        ptr::null_mut(),
        ptr::null_mut(),
        ptr::null_mut(),
        frame_base,
    )
}

unsafe extern "C" fn do_resume_stolen(p0: *mut u8, _p1: *mut u8, _p2: *mut u8, _p3: *mut u8) {
    // p0 points into the frames we are about to overwrite: copy first
    let arg = ptr::read(p0 as *const StolenArg);

    let w = current();
    let transport = &*(*w).transport;

    // round the transfer to transport alignment; identical addresses on
    // both sides is the iso-address invariant
    let base = arg.entry.frame_base as usize & !7;
    let size = (arg.entry.frame_size + (arg.entry.frame_base as usize - base) + 7) & !7;

    transport.get(base as *mut u8, RemotePtr::new(base), size, arg.victim);

    // the frame image is local: release the victim's queue
    RemoteQueue::unlock_raw(transport, arg.victim_header, arg.victim);

    tracing::trace!(
        victim = arg.victim,
        frame_base = base,
        frame_size = size,
        "resuming a stolen frame"
    );

    resume_context(arg.entry.ctx)
}

/// Pick a victim uniformly at random, excluding self. Stateless: no
/// memory of past failures, no backoff.
fn select_victim(transport: &dyn Transport) -> Pid {
    let me = transport.pid();
    let n = transport.n_procs();
    debug_assert!(n > 1);
    let mut rng = rand::rng();
    loop {
        let victim = rng.random_range(0..n);
        if victim != me {
            return victim;
        }
    }
}

/// One steal attempt against a random victim. On success the victim's
/// queue remains locked; the lock is released after the frame transfer in
/// [`do_resume_stolen`].
unsafe fn steal_with_lock(w: *mut Worker) -> Option<StolenArg> {
    let transport = &*(*w).transport;
    let victim = select_victim(transport);

    let rq = RemoteQueue::new(
        transport,
        victim,
        (&(*w).taskq_addrs)[victim],
        (&(*w).entry_addrs)[victim],
    );

    if rq.is_empty() {
        (*w).stats.record_failure(StealFailure::Aborted);
        return None;
    }

    if !rq.try_lock() {
        (*w).stats.record_failure(StealFailure::LockContended);
        return None;
    }

    match rq.steal() {
        Some(entry) => {
            (*w).stats.n_success += 1;
            tracing::debug!(victim, "steal succeeded");
            Some(StolenArg {
                entry,
                victim,
                victim_header: (&(*w).taskq_addrs)[victim],
            })
        }
        None => {
            rq.unlock();
            (*w).stats.record_failure(StealFailure::EmptyRace);
            None
        }
    }
}

/// One unit of scheduler work; see the module docs for the step order.
///
/// # Safety
/// Must run in task context on the iso-address stack.
pub(crate) unsafe fn do_scheduler_work(w: *mut Worker) {
    let popped = (*(*w).taskq).pop();

    (*w).transport.poll();

    if let Some(entry) = popped {
        // resume the parent continuation; its frame is still resident
        debug_assert!(!(*w).is_main_task);
        let ctx = entry.ctx;
        suspend(move |sctx| {
            // SAFETY: continuation runs in task context.
            unsafe {
                let w = current();
                (*w).waitq.push_back(sctx);
                resume_context(ctx)
            }
        });
    } else if !(*w).is_main_task && !(*w).main_ctx.is_null() {
        // the main task's frames are resident and nobody is running them
        (*w).is_main_task = true;
        let ctx = (*w).main_ctx;
        suspend(move |sctx| {
            // SAFETY: continuation runs in task context.
            unsafe {
                let w = current();
                (*w).waitq.push_back(sctx);
                resume_context(ctx)
            }
        });
    } else {
        let stolen = if (*w).transport.n_procs() > 1 {
            steal_with_lock(w)
        } else {
            None
        };

        if let Some(arg) = stolen {
            (*w).main_ctx = ptr::null_mut();
            suspend(move |sctx| {
                let mut arg = arg;
                // SAFETY: continuation runs in task context.
                unsafe { resume_stolen(sctx, &mut arg as *mut StolenArg) }
            });
        } else if let Some(next) = (*w).waitq.pop_front() {
            (*w).main_ctx = ptr::null_mut();
            suspend(move |sctx| {
                // SAFETY: continuation runs in task context.
                unsafe { resume_saved(sctx, next) }
            });
        }
        // nothing to do: the caller polls and retries
    }
}

/// Scheduler-cooperative barrier: keep doing scheduler work until every
/// process has entered the barrier.
pub(crate) unsafe fn cooperative_barrier(w: *mut Worker) {
    while !(*w).transport.barrier_try() {
        do_scheduler_work(w);
    }
}

struct StartParams<F> {
    worker: *mut Worker,
    f: ManuallyDrop<F>,
}

/// Switch to the iso-address stack and run `f` as the main task. Returns
/// after the main task and the closing cooperative barrier complete.
///
/// # Safety
/// The worker must be installed as this thread's current worker and the
/// iso region reserved for the lifetime of the call.
pub(crate) unsafe fn start_main<F: FnOnce()>(w: *mut Worker, ispace: &IsoSpace, f: F) {
    let mut params = StartParams {
        worker: w,
        f: ManuallyDrop::new(f),
    };

    tracing::debug!(
        pid = (*w).transport.pid(),
        stack_base = ispace.stack() as usize,
        stack_size = ispace.stack_size(),
        "entering the iso-address stack"
    );

    call_on_new_stack(
        &mut params as *mut StartParams<F> as *mut u8,
        ptr::null_mut(),
        ptr::null_mut(),
        ptr::null_mut(),
        ispace.initial_stack_ptr(),
        main_stack_entry::<F>,
    );
}

unsafe extern "C" fn main_stack_entry<F: FnOnce()>(
    p0: *mut u8,
    _p1: *mut u8,
    _p2: *mut u8,
    _p3: *mut u8,
) {
    // the root context has no parent; it is never packed and never queued
    save_context_with_call(ptr::null_mut(), main_task_handler::<F>, p0, ptr::null_mut());
}

unsafe extern "C" fn main_task_handler<F: FnOnce()>(
    ctx: *mut Context,
    p0: *mut u8,
    _arg1: *mut u8,
) {
    let params = p0 as *mut StartParams<F>;
    let w = (*params).worker;

    (*w).stack_bottom = current_stack_pointer();
    (*w).max_stack_usage = 0;
    (*w).parent_ctx = ctx;
    (*w).is_main_task = true;

    let f = ManuallyDrop::take(&mut (*params).f);
    f();

    // all processes drain their remaining work before anyone leaves
    let w = current();
    cooperative_barrier(w);

    (*w).parent_ctx = ptr::null_mut();
    (*w).is_main_task = false;
}
