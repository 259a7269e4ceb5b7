//! Pool sizing policy
//!
//! Maps an environment class and resource hint to worker count, queue
//! capacity and batch chunk size. Serverless CPU share is proportional to the
//! configured memory (one full core at 1769MB), so worker count follows memory
//! there; elsewhere it follows the visible core count.

use crate::environment::RuntimeEnvironment;

/// Upper bound on workers in a managed container
pub const CONTAINER_WORKER_CAP: usize = 40;

/// Upper bound on workers for a local process
pub const LOCAL_WORKER_CAP: usize = 20;

/// Worker count used locally on machines with fewer than four cores
pub const LOCAL_SMALL_HOST_WORKERS: usize = 8;

/// Optimal worker count for the environment, using the host's CPU count.
pub fn optimal_worker_count(env: RuntimeEnvironment, memory_hint_mb: u64) -> usize {
    worker_count_for(env, memory_hint_mb, num_cpus::get())
}

/// Optimal worker count with an explicit core count.
pub fn worker_count_for(env: RuntimeEnvironment, memory_hint_mb: u64, cpu_cores: usize) -> usize {
    match env {
        RuntimeEnvironment::ConstrainedServerless => serverless_workers(memory_hint_mb),
        RuntimeEnvironment::ManagedContainer => (4 * cpu_cores.max(1)).min(CONTAINER_WORKER_CAP),
        RuntimeEnvironment::Local => {
            let workers = if cpu_cores >= 4 {
                2 * cpu_cores
            } else {
                LOCAL_SMALL_HOST_WORKERS
            };
            workers.min(LOCAL_WORKER_CAP)
        }
    }
}

fn serverless_workers(memory_hint_mb: u64) -> usize {
    match memory_hint_mb {
        0..=511 => 2,
        512..=1023 => 3,
        1024..=1768 => 4,
        1769..=3007 => 6,
        _ => 8,
    }
}

/// Items per chunk before remaining time is re-checked.
pub fn optimal_batch_chunk_size(env: RuntimeEnvironment) -> usize {
    match env {
        // Matches common bulk-write API limits
        RuntimeEnvironment::ConstrainedServerless => 25,
        RuntimeEnvironment::ManagedContainer => 100,
        RuntimeEnvironment::Local => 50,
    }
}

/// Bounded task queue capacity.
pub fn optimal_queue_capacity(env: RuntimeEnvironment) -> usize {
    match env {
        RuntimeEnvironment::ConstrainedServerless => 100,
        RuntimeEnvironment::ManagedContainer => 1000,
        RuntimeEnvironment::Local => 500,
    }
}
