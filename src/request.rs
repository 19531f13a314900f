//! Asynchronous, cancellable units of computation.
//!
//! A [`Request`] wraps one potentially long-running function - typically
//! "resolve this slot for this roi" - and runs it on the [`Workers`] pool
//! or inline. State machine:
//!
//! `pending -> running -> { finished | failed | cancelled }`
//!
//! Three separate notification channels mirror the three terminal states.
//! Cancellation is *not* a failure: it is never logged as an error and
//! never delivered to `notify_failed`.
//!
//! # Chaining
//!
//! A request created while another request is running (on the same thread)
//! becomes its child: cancelling the parent cancels still-pending children
//! through the linked tokens. The link is maintained with an ambient
//! thread-local, so operator code never threads tokens by hand.
//!
//! # Deadlock avoidance
//!
//! `wait()` on a request that nobody started yet claims the work and runs
//! it inline on the calling thread. Nested `slot.request(..).wait()` calls
//! inside `execute()` therefore never starve the pool, no matter how deep
//! the operator chain is.

use std::cell::RefCell;
use std::sync::{Arc, Condvar, Mutex, Weak};

use log::{error, trace};

use crate::cancel::{CancellationToken, CancellationTokenSource};
use crate::error::GraphError;
use crate::workers::Workers;

/// Lifecycle of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestState::Finished | RequestState::Failed | RequestState::Cancelled
        )
    }
}

type Work<T> = Box<dyn FnOnce(&CancellationToken) -> Result<T, GraphError> + Send>;
type FinishedCallback<T> = Box<dyn FnOnce(&T) + Send>;
type FailedCallback = Box<dyn FnOnce(&GraphError) + Send>;
type CancelledCallback = Box<dyn FnOnce() + Send>;

struct Inner<T> {
    state: RequestState,
    work: Option<Work<T>>,
    result: Option<Arc<T>>,
    error: Option<GraphError>,
    finished_cbs: Vec<FinishedCallback<T>>,
    failed_cbs: Vec<FailedCallback>,
    cancelled_cbs: Vec<CancelledCallback>,
    submitted: bool,
}

struct Shared<T> {
    inner: Mutex<Inner<T>>,
    cond: Condvar,
    source: CancellationTokenSource,
}

thread_local! {
    // Tokens of requests currently running on this thread, innermost last.
    static AMBIENT_TOKENS: RefCell<Vec<CancellationToken>> = const { RefCell::new(Vec::new()) };
}

/// Handle to one asynchronous computation yielding a `T`.
///
/// Cheap to clone; all clones address the same underlying state. A
/// finished request's result is immutable and can be waited on any number
/// of times without recomputation.
pub struct Request<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Request<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

// `Sync` because the shared result (`Arc<T>`) crosses threads with the
// request handle.
impl<T: Send + Sync + 'static> Request<T> {
    /// Wrap `work` in a pending request.
    ///
    /// If called from inside a running request, the new request is linked
    /// as its child for cancellation purposes.
    pub fn new<F>(work: F) -> Self
    where
        F: FnOnce(&CancellationToken) -> Result<T, GraphError> + Send + 'static,
    {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                state: RequestState::Pending,
                work: Some(Box::new(work)),
                result: None,
                error: None,
                finished_cbs: Vec::new(),
                failed_cbs: Vec::new(),
                cancelled_cbs: Vec::new(),
                submitted: false,
            }),
            cond: Condvar::new(),
            source: CancellationTokenSource::new(),
        });

        // Cancelling the token retires the request if it never started.
        let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
        shared.source.token().add_callback(move || {
            if let Some(shared) = weak.upgrade() {
                complete_cancelled_if_pending(&shared);
            }
        });

        // Parent link: the innermost ambient token cancels us with it.
        if let Some(parent) = Self::current_token() {
            let weak: Weak<Shared<T>> = Arc::downgrade(&shared);
            parent.add_callback(move || {
                // Pending children retire immediately; running ones notice
                // the flag cooperatively.
                if let Some(shared) = weak.upgrade() {
                    shared.source.cancel();
                }
            });
        }

        Self { shared }
    }

    /// Token of the request currently running on this thread, if any.
    /// Operator code can poll this at safe points for cooperative
    /// cancellation.
    pub fn current_token() -> Option<CancellationToken> {
        AMBIENT_TOKENS.with(|stack| stack.borrow().last().cloned())
    }

    /// Enqueue on the pool. Idempotent: a second submit is a no-op.
    pub fn submit(&self, workers: &Workers) {
        {
            let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            if inner.submitted || inner.state != RequestState::Pending {
                return;
            }
            inner.submitted = true;
        }
        let shared = Arc::clone(&self.shared);
        workers.execute(move || {
            run_claimed(&shared);
        });
    }

    /// Block until a terminal state, returning the result, the failure, or
    /// `GraphError::Cancelled`.
    ///
    /// If the request was never started, the calling thread claims and
    /// runs it inline.
    pub fn wait(&self) -> Result<T, GraphError>
    where
        T: Clone,
    {
        run_claimed(&self.shared);

        let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        while !inner.state.is_terminal() {
            inner = self
                .shared
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
        match inner.state {
            RequestState::Finished => Ok(inner
                .result
                .as_ref()
                .map(|r| (**r).clone())
                .ok_or(GraphError::Cancelled)?),
            RequestState::Failed => Err(inner.error.clone().unwrap_or(GraphError::Cancelled)),
            _ => Err(GraphError::Cancelled),
        }
    }

    /// Request cancellation. Cooperative: a pending request is retired
    /// immediately, a running one keeps going until it observes the token.
    /// A no-op once the request reached a terminal state.
    pub fn cancel(&self) {
        self.shared.source.cancel();
    }

    /// This request's cancellation token (observe-only).
    pub fn token(&self) -> CancellationToken {
        self.shared.source.token()
    }

    pub fn state(&self) -> RequestState {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state
    }

    /// Register a success observer. Fires with the result when the request
    /// finishes; fires immediately if it already has.
    pub fn notify_finished<F: FnOnce(&T) + Send + 'static>(&self, callback: F) {
        let immediate = {
            let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                RequestState::Finished => inner.result.clone(),
                RequestState::Pending | RequestState::Running => {
                    inner.finished_cbs.push(Box::new(callback));
                    return;
                }
                _ => return,
            }
        };
        if let Some(result) = immediate {
            callback(&result);
        }
    }

    /// Register a failure observer. Never fires for cancellation.
    pub fn notify_failed<F: FnOnce(&GraphError) + Send + 'static>(&self, callback: F) {
        let immediate = {
            let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                RequestState::Failed => inner.error.clone(),
                RequestState::Pending | RequestState::Running => {
                    inner.failed_cbs.push(Box::new(callback));
                    return;
                }
                _ => return,
            }
        };
        if let Some(err) = immediate {
            callback(&err);
        }
    }

    /// Register a cancellation observer ("you are not getting a result").
    pub fn notify_cancelled<F: FnOnce() + Send + 'static>(&self, callback: F) {
        {
            let mut inner = self.shared.inner.lock().unwrap_or_else(|e| e.into_inner());
            match inner.state {
                RequestState::Cancelled => {}
                RequestState::Pending | RequestState::Running => {
                    inner.cancelled_cbs.push(Box::new(callback));
                    return;
                }
                _ => return,
            }
        }
        callback();
    }
}

/// Claim the pending work and execute it on the current thread. Returns
/// silently if someone else already claimed it.
fn run_claimed<T: Send + Sync + 'static>(shared: &Arc<Shared<T>>) {
    let work = {
        let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state != RequestState::Pending {
            return;
        }
        match inner.work.take() {
            Some(work) => {
                inner.state = RequestState::Running;
                work
            }
            None => return,
        }
    };

    let token = shared.source.token();
    if token.cancelled() {
        complete_cancelled(shared);
        return;
    }

    AMBIENT_TOKENS.with(|stack| stack.borrow_mut().push(token.clone()));
    // Contain panics: an unwinding worker must still drive the request to
    // a terminal state, or every waiter blocks forever.
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| work(&token)))
        .unwrap_or_else(|payload| {
            Err(GraphError::Execution(format!(
                "request panicked: {}",
                panic_message(payload.as_ref())
            )))
        });
    AMBIENT_TOKENS.with(|stack| {
        stack.borrow_mut().pop();
    });

    match outcome {
        // A result computed after cancellation must never be delivered.
        Ok(_) if token.cancelled() => complete_cancelled(shared),
        Ok(value) => complete_finished(shared, value),
        Err(e) if e.is_cancelled() => complete_cancelled(shared),
        Err(e) => complete_failed(shared, e),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string payload>".to_string()
    }
}

fn complete_finished<T>(shared: &Shared<T>, value: T) {
    let (result, callbacks) = {
        let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state.is_terminal() {
            return;
        }
        inner.state = RequestState::Finished;
        let result = Arc::new(value);
        inner.result = Some(Arc::clone(&result));
        inner.failed_cbs.clear();
        inner.cancelled_cbs.clear();
        (result, std::mem::take(&mut inner.finished_cbs))
    };
    shared.cond.notify_all();
    trace!("Request finished ({} observers)", callbacks.len());
    for cb in callbacks {
        cb(&result);
    }
}

fn complete_failed<T>(shared: &Shared<T>, err: GraphError) {
    let (err, callbacks) = {
        let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state.is_terminal() {
            return;
        }
        inner.state = RequestState::Failed;
        inner.error = Some(err.clone());
        inner.finished_cbs.clear();
        inner.cancelled_cbs.clear();
        (err, std::mem::take(&mut inner.failed_cbs))
    };
    shared.cond.notify_all();
    error!("Request failed: {}", err);
    for cb in callbacks {
        cb(&err);
    }
}

fn complete_cancelled<T>(shared: &Shared<T>) {
    let callbacks = {
        let mut inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.state.is_terminal() {
            return;
        }
        inner.state = RequestState::Cancelled;
        inner.work = None;
        inner.finished_cbs.clear();
        inner.failed_cbs.clear();
        std::mem::take(&mut inner.cancelled_cbs)
    };
    shared.cond.notify_all();
    trace!("Request cancelled ({} observers)", callbacks.len());
    for cb in callbacks {
        cb();
    }
}

fn complete_cancelled_if_pending<T>(shared: &Shared<T>) {
    let is_pending = {
        let inner = shared.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state == RequestState::Pending
    };
    if is_pending {
        complete_cancelled(shared);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_wait_runs_inline() {
        let req = Request::new(|_| Ok(21 * 2));
        assert_eq!(req.state(), RequestState::Pending);
        assert_eq!(req.wait().unwrap(), 42);
        assert_eq!(req.state(), RequestState::Finished);
    }

    #[test]
    fn test_finished_result_is_rewaitable() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&runs);
        let req = Request::new(move |_| {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });
        assert_eq!(req.wait().unwrap(), 7);
        assert_eq!(req.wait().unwrap(), 7);
        // Work executed exactly once
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_submit_to_pool() {
        let workers = Workers::new(2);
        let req = Request::new(|_| Ok("done".to_string()));
        req.submit(&workers);
        assert_eq!(req.wait().unwrap(), "done");
    }

    #[test]
    fn test_notify_finished_async() {
        let workers = Workers::new(1);
        let (tx, rx) = mpsc::channel();
        let req = Request::new(|_| Ok(5usize));
        req.notify_finished(move |v| tx.send(*v).unwrap());
        req.submit(&workers);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 5);
    }

    #[test]
    fn test_failure_channel() {
        let req: Request<i32> =
            Request::new(|_| Err(GraphError::Execution("boom".to_string())));
        let (tx, rx) = mpsc::channel();
        req.notify_failed(move |e| tx.send(e.to_string()).unwrap());

        let err = req.wait().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(rx.recv().unwrap(), "boom");
        assert_eq!(req.state(), RequestState::Failed);
    }

    #[test]
    fn test_failed_does_not_fire_finished() {
        let req: Request<i32> =
            Request::new(|_| Err(GraphError::Execution("boom".to_string())));
        let finished = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&finished);
        req.notify_finished(move |_| f.store(true, Ordering::SeqCst));
        let _ = req.wait();
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cancel_pending_never_runs() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = Arc::clone(&ran);
        let req = Request::new(move |_| {
            r.store(true, Ordering::SeqCst);
            Ok(())
        });
        let (tx, rx) = mpsc::channel();
        req.notify_cancelled(move || tx.send(()).unwrap());

        req.cancel();
        assert_eq!(req.state(), RequestState::Cancelled);
        rx.recv().unwrap();
        assert!(matches!(req.wait(), Err(GraphError::Cancelled)));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cooperative_cancel_running() {
        let workers = Workers::new(1);
        let (started_tx, started_rx) = mpsc::channel();
        let req = Request::new(move |token: &CancellationToken| {
            started_tx.send(()).unwrap();
            // Poll the token like a long-running execute() would
            for _ in 0..500 {
                if token.cancelled() {
                    return Err(GraphError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Ok(1)
        });
        req.submit(&workers);
        started_rx.recv().unwrap();
        req.cancel();
        assert!(matches!(req.wait(), Err(GraphError::Cancelled)));
        assert_eq!(req.state(), RequestState::Cancelled);
    }

    #[test]
    fn test_cancelled_not_delivered_as_failure() {
        let req: Request<i32> = Request::new(|_| Ok(1));
        let failed = Arc::new(AtomicBool::new(false));
        let f = Arc::clone(&failed);
        req.notify_failed(move |_| f.store(true, Ordering::SeqCst));
        req.cancel();
        let _ = req.wait();
        assert!(!failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_child_cancelled_with_parent() {
        // Parent spawns a child request while running; cancelling the
        // parent token retires the still-pending child.
        let parent: Request<Request<i32>> = Request::new(|token| {
            let child: Request<i32> = Request::new(|_| Ok(3));
            // Simulate the parent being cancelled mid-flight
            assert!(!token.cancelled());
            Ok(child)
        });
        let child = parent.wait().unwrap();
        // Parent finished normally here, so the child is still pending
        assert_eq!(child.state(), RequestState::Pending);
        assert_eq!(child.wait().unwrap(), 3);
    }

    #[test]
    fn test_parent_cancel_propagates_to_pending_child() {
        let workers = Workers::new(1);
        let (child_tx, child_rx) = mpsc::channel::<Request<i32>>();
        let (started_tx, started_rx) = mpsc::channel();

        let parent: Request<()> = Request::new(move |token| {
            let child: Request<i32> = Request::new(|_| Ok(9));
            child_tx.send(child).unwrap();
            started_tx.send(()).unwrap();
            // Wait for the cancel before returning
            while !token.cancelled() {
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(GraphError::Cancelled)
        });
        parent.submit(&workers);
        started_rx.recv().unwrap();
        let child = child_rx.recv().unwrap();

        parent.cancel();
        let _ = parent.wait();
        assert!(matches!(child.wait(), Err(GraphError::Cancelled)));
        assert_eq!(child.state(), RequestState::Cancelled);
    }

    #[test]
    fn test_panicking_work_fails_all_waiters() {
        let workers = Workers::new(1);
        let req: Request<i32> = Request::new(|_| panic!("boom"));
        let other = req.clone();
        let waiter = std::thread::spawn(move || other.wait());
        req.submit(&workers);

        let err = req.wait().unwrap_err();
        assert!(matches!(err, GraphError::Execution(_)));
        assert!(err.to_string().contains("boom"));
        assert_eq!(req.state(), RequestState::Failed);

        // The second waiter is released with the same failure
        let err = waiter.join().unwrap().unwrap_err();
        assert!(matches!(err, GraphError::Execution(_)));
    }

    #[test]
    fn test_panic_pops_ambient_token() {
        let bad: Request<i32> = Request::new(|_| panic!("boom"));
        let _ = bad.wait();
        // The thread's ambient stack is clean: a fresh request created
        // here has no parent token to link to
        assert!(Request::<i32>::current_token().is_none());
    }

    #[test]
    fn test_late_observers_fire_immediately() {
        let req = Request::new(|_| Ok(11));
        req.wait().unwrap();
        let (tx, rx) = mpsc::channel();
        req.notify_finished(move |v| tx.send(*v).unwrap());
        assert_eq!(rx.try_recv().unwrap(), 11);
    }
}
