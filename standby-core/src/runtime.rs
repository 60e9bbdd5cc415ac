//! Tokio runtime setup.
//!
//! Accept-loop latency matters more than throughput here, so workers can be
//! pinned to cores to keep the registry's cache lines warm, and the blocking
//! pool is kept small.

use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

/// Worker naming/pinning counter
static WORKER_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Configuration for the Standby runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (default: number of CPU cores)
    pub worker_threads: usize,
    /// Maximum blocking threads (default: 2)
    pub max_blocking_threads: usize,
    /// Pin each worker to its own core
    pub enable_cpu_pinning: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: available_cores(),
            max_blocking_threads: 2,
            enable_cpu_pinning: true,
        }
    }
}

/// Returns the number of available CPU cores.
#[inline]
pub fn available_cores() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

/// Build the multi-threaded runtime the admission front runs on.
///
/// # Example
///
/// ```
/// use standby_core::runtime::{build_runtime, RuntimeConfig};
///
/// let rt = build_runtime(RuntimeConfig {
///     worker_threads: 1,
///     enable_cpu_pinning: false,
///     ..Default::default()
/// })
/// .expect("runtime build failed");
/// rt.block_on(async {});
/// ```
pub fn build_runtime(config: RuntimeConfig) -> std::io::Result<Runtime> {
    let core_ids = if config.enable_cpu_pinning {
        core_affinity::get_core_ids().unwrap_or_default()
    } else {
        Vec::new()
    };

    info!(
        worker_threads = config.worker_threads,
        blocking_threads = config.max_blocking_threads,
        pinned_cores = core_ids.len(),
        "Building Standby runtime"
    );

    let mut builder = Builder::new_multi_thread();
    builder
        .worker_threads(config.worker_threads.max(1))
        .max_blocking_threads(config.max_blocking_threads.max(1))
        .enable_all()
        .thread_name("standby-worker")
        .on_thread_start(move || {
            let worker_id = WORKER_COUNTER.fetch_add(1, Ordering::Relaxed);
            let Some(core_id) = core_ids.get(worker_id).copied() else {
                return;
            };

            if core_affinity::set_for_current(core_id) {
                debug!(worker_id = worker_id, core_id = core_id.id, "Worker pinned to core");
            } else {
                warn!(worker_id = worker_id, core_id = core_id.id, "Failed to pin worker to core");
            }
        });

    builder.build()
}
