//! Runtime options.
//!
//! Options are loaded once from environment variables, mirroring how
//! cluster jobs are usually configured (per-job environment rather than
//! per-process files):
//!
//! | variable                    | default | meaning                          |
//! |-----------------------------|---------|----------------------------------|
//! | `ISOWEAVE_STACK_SIZE`       | 256 KiB | iso-address stack bytes          |
//! | `ISOWEAVE_TASKQ_CAPACITY`   | 1024    | task queue entries               |
//! | `ISOWEAVE_FUTURE_BUF_SIZE`  | 16 KiB  | future slot arena bytes          |
//! | `ISOWEAVE_RETPOOL_CAPACITY` | 16384   | distributed return pool entries  |
//! | `ISOWEAVE_STACK_DETECT`     | 1       | guard page under the iso stack   |
//!
//! Tests and embedders can bypass the environment entirely by passing an
//! explicit [`RuntimeOptions`] to `Process::with_options`.

use once_cell::sync::Lazy;

/// Tunable runtime parameters, fixed for the lifetime of a process.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Size of the iso-address stack region in bytes.
    pub stack_size: usize,
    /// Capacity of the task queue in entries.
    pub taskq_capacity: usize,
    /// Size of the future slot arena in bytes.
    pub future_buf_size: usize,
    /// Capacity of the distributed return pool in entries.
    pub retpool_capacity: usize,
    /// Whether to place a guard page below the iso-address stack.
    pub stack_overflow_detection: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            taskq_capacity: 1024,
            future_buf_size: 16 * 1024,
            retpool_capacity: 16 * 1024,
            stack_overflow_detection: true,
        }
    }
}

impl RuntimeOptions {
    /// Load options from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stack_size: env_usize("ISOWEAVE_STACK_SIZE", defaults.stack_size),
            taskq_capacity: env_usize("ISOWEAVE_TASKQ_CAPACITY", defaults.taskq_capacity),
            future_buf_size: env_usize("ISOWEAVE_FUTURE_BUF_SIZE", defaults.future_buf_size),
            retpool_capacity: env_usize("ISOWEAVE_RETPOOL_CAPACITY", defaults.retpool_capacity),
            stack_overflow_detection: env_usize(
                "ISOWEAVE_STACK_DETECT",
                defaults.stack_overflow_detection as usize,
            ) != 0,
        }
    }
}

static OPTIONS: Lazy<RuntimeOptions> = Lazy::new(RuntimeOptions::from_env);

/// The process-wide option snapshot (environment read exactly once).
#[inline]
pub fn global() -> &'static RuntimeOptions {
    &OPTIONS
}

fn env_usize(name: &str, default: usize) -> usize {
    match std::env::var(name) {
        Ok(s) => match s.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(option = name, value = %s, "unparsable option value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
