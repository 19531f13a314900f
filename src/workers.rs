//! Worker thread pool executing submitted requests.
//!
//! Uses crossbeam for an efficient MPMC queue with closure-based task
//! execution. The pool is an explicit, injectable dependency: the [`Graph`]
//! owns one, tests can construct their own with a deterministic thread
//! count. There is no hidden global pool.
//!
//! Cancellation of in-flight work is cooperative and lives in the request
//! layer (see [`crate::request`]); the pool itself only runs closures.
//!
//! [`Graph`]: crate::graph::Graph

use crossbeam_channel::{Sender, unbounded};
use log::{debug, error};
use std::sync::Arc;
use std::thread;

use crate::config::default_worker_count;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size worker pool for request execution.
///
/// Workers execute arbitrary closures with captured state. Dropping the
/// last handle closes the channel and the threads exit their recv loop.
pub struct Workers {
    sender: Sender<Job>,
    _handles: Vec<thread::JoinHandle<()>>, // Keep handles to prevent premature drop
    num_threads: usize,
}

impl Workers {
    /// Create a pool with `num_threads` threads (minimum 1).
    pub fn new(num_threads: usize) -> Arc<Self> {
        let num_threads = num_threads.max(1);
        let (tx, rx): (Sender<Job>, _) = unbounded();
        let mut handles = Vec::new();

        for worker_id in 0..num_threads {
            let rx = rx.clone();

            let handle = thread::Builder::new()
                .name(format!("flowgraph-worker-{}", worker_id))
                .spawn(move || {
                    debug!("Worker {} started", worker_id);

                    // Worker loop: execute closures until channel closes
                    while let Ok(job) = rx.recv() {
                        job();
                    }

                    debug!("Worker {} stopped", worker_id);
                })
                .expect("Failed to spawn worker thread");

            handles.push(handle);
        }

        debug!("Workers initialized: {} threads", num_threads);

        Arc::new(Self {
            sender: tx,
            _handles: handles,
            num_threads,
        })
    }

    /// Create a pool sized by the machine's CPU count, leaving headroom
    /// for the caller's own thread.
    pub fn with_default_size() -> Arc<Self> {
        Self::new(default_worker_count())
    }

    /// Execute a closure on a worker thread. Runs asynchronously, no
    /// return value; the request layer wires results back through its own
    /// state machine.
    pub fn execute<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.sender.send(Box::new(f)) {
            error!("Failed to enqueue job: {}", e);
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }
}

// Drop: channel closes automatically, threads exit gracefully
impl Drop for Workers {
    fn drop(&mut self) {
        debug!("Workers shutting down ({} threads)...", self._handles.len());
    }
}

impl std::fmt::Debug for Workers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workers")
            .field("num_threads", &self.num_threads)
            .finish()
    }
}
