//! Graph: the shared context every operator is constructed against.
//!
//! A `Graph` is a cheap-clone handle. It owns the [`Workers`] executor that
//! runs submitted requests, so passing the graph around is how the
//! executor gets injected - there is no process-global pool. Tests build a
//! small deterministic graph with [`Graph::for_testing`].
//!
//! The graph does not own operators; ownership flows through `Arc`s held
//! by application code (and parent operators for children). The graph only
//! counts constructions for diagnostics.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::debug;

use crate::request::Request;
use crate::workers::Workers;

struct GraphInner {
    workers: Arc<Workers>,
    operator_count: AtomicUsize,
}

/// Shared engine context: executor plus bookkeeping.
#[derive(Clone)]
pub struct Graph {
    inner: Arc<GraphInner>,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Graph with a machine-sized worker pool.
    pub fn new() -> Self {
        Self::with_workers(Workers::with_default_size())
    }

    /// Graph with an explicit executor (dependency injection seam).
    pub fn with_workers(workers: Arc<Workers>) -> Self {
        debug!("Graph created ({} worker threads)", workers.num_threads());
        Self {
            inner: Arc::new(GraphInner {
                workers,
                operator_count: AtomicUsize::new(0),
            }),
        }
    }

    /// Two deterministic worker threads; enough to exercise concurrency
    /// without machine-dependent behavior.
    pub fn for_testing() -> Self {
        Self::with_workers(Workers::new(2))
    }

    pub fn workers(&self) -> &Arc<Workers> {
        &self.inner.workers
    }

    /// Submit a request to this graph's pool.
    pub fn submit<T: Send + Sync + 'static>(&self, request: &Request<T>) {
        request.submit(&self.inner.workers);
    }

    /// Number of operators constructed against this graph (diagnostic).
    pub fn operator_count(&self) -> usize {
        self.inner.operator_count.load(Ordering::Relaxed)
    }

    pub(crate) fn note_operator_created(&self) {
        self.inner.operator_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("workers", &self.inner.workers.num_threads())
            .field("operators", &self.operator_count())
            .finish()
    }
}
