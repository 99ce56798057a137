//! Process lifecycle: collective initialization, the main-task entry
//! point, and teardown.
//!
//! A [`Process`] replaces the ambient global a runtime like this would
//! traditionally keep: it is created explicitly at process start, installed
//! as the thread's current worker only for the duration of
//! [`Process::start`], and torn down at the end. Multiple logical
//! processes can therefore coexist in one test binary, each on its own
//! thread with its own transport endpoint.

use std::sync::Arc;

use crate::error::InitError;
use crate::runtime::iso_space::IsoSpace;
use crate::runtime::scheduler::{self, EnterGuard, StealStats, Worker};
use crate::transport::{Pid, Transport};
use crate::util::options::{self, RuntimeOptions};

/// One runtime process: worker, iso-address stack region, transport.
pub struct Process {
    transport: Arc<dyn Transport>,
    options: RuntimeOptions,
    ispace: IsoSpace,
    worker: Box<Worker>,
    finalized: bool,
}

impl Process {
    /// Collective initialization with environment-derived options.
    ///
    /// Must be invoked on every process of the job, in the same order
    /// relative to other collective calls. A failure here means the
    /// cluster is only partially initialized; the caller must abort
    /// startup, not continue.
    pub fn init(transport: Arc<dyn Transport>) -> Result<Self, InitError> {
        Self::with_options(transport, options::global().clone())
    }

    /// Collective initialization with explicit options.
    pub fn with_options(
        transport: Arc<dyn Transport>,
        options: RuntimeOptions,
    ) -> Result<Self, InitError> {
        let ispace = IsoSpace::reserve(&*transport, &options)?;
        let worker = Worker::initialize(transport.clone(), &options, &ispace)?;

        // nobody schedules until everybody finished initializing
        transport.barrier();

        tracing::info!(
            pid = transport.pid(),
            n_procs = transport.n_procs(),
            stack_size = options.stack_size,
            taskq_capacity = options.taskq_capacity,
            "runtime process initialized"
        );

        Ok(Self {
            transport,
            options,
            ispace,
            worker,
            finalized: false,
        })
    }

    /// Run `entry` as the main task on the iso-address stack.
    ///
    /// Returns once the main task has completed *and* every process has
    /// drained its remaining work (a scheduler-cooperative barrier closes
    /// the phase). The main task is pinned to this process: it can fork
    /// work that gets stolen, but its own frames are never migrated.
    pub fn start<F: FnOnce()>(&mut self, entry: F) -> Result<(), InitError> {
        let worker: *mut Worker = &mut *self.worker;
        let _guard = EnterGuard::enter(worker)?;

        // SAFETY: the worker is installed for this thread and the iso
        // region outlives the call.
        unsafe {
            scheduler::start_main(worker, &self.ispace, entry);
        }

        tracing::debug!(pid = self.transport.pid(), "main task finished");
        Ok(())
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.transport.pid()
    }

    #[inline]
    pub fn n_procs(&self) -> usize {
        self.transport.n_procs()
    }

    #[inline]
    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    /// Steal outcome counters of this process's worker.
    pub fn steal_stats(&self) -> &StealStats {
        self.worker.steal_stats()
    }

    /// High-water mark of iso-address stack usage, in bytes.
    pub fn max_stack_usage(&self) -> usize {
        self.worker.max_stack_usage()
    }

    /// Collective teardown. Idempotent; also run on drop.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;

        // all processes leave together before memory is released
        self.transport.barrier();

        self.worker.finalize();
        self.ispace.release(&*self.transport);

        tracing::info!(pid = self.transport.pid(), "runtime process finalized");
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        self.finalize();
    }
}
