//! Engine-wide defaults.

/// Default worker thread count: 75% of logical CPUs, minimum 1.
/// Leaves headroom for the thread driving the graph (GUI or main).
pub fn default_worker_count() -> usize {
    (num_cpus::get() * 3 / 4).max(1)
}

/// Default block capacity of an [`OpArrayCache`](crate::operators::OpArrayCache).
pub const DEFAULT_CACHE_BLOCKS: usize = 256;
