//! Bounded worker pool for background tasks.
//!
//! One worker thread drains a queue capped at [`QUEUE_LIMIT`] tasks; excess
//! submissions are discarded silently. The evictor is probabilistic and
//! lossy, so a dropped batch just means the next write re-samples -- the
//! alternative (an unbounded queue, or blocking the write path) is worse.
//! Task failures and panics are routed to the failsafe error handler and
//! never terminate the worker.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use threadpool::ThreadPool;
use tracing::debug;

use crate::failsafe::Failsafe;
use crate::StoreError;

/// Queue capacity; submissions beyond this are dropped.
pub const QUEUE_LIMIT: usize = 100;

/// Optional host-runtime wrapper applied around every task, e.g. to enter
/// the host framework's execution context before the task body runs.
pub type TaskWrapper = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// The background execution layer.
pub struct Executor {
    pool: ThreadPool,
    queue_limit: usize,
    wrapper: Option<TaskWrapper>,
    instrumentation: bool,
    failsafe: Failsafe,
}

impl Executor {
    /// Creates a single-worker executor.
    #[must_use]
    pub fn new(wrapper: Option<TaskWrapper>, instrumentation: bool, failsafe: Failsafe) -> Self {
        Self {
            pool: ThreadPool::new(1),
            queue_limit: QUEUE_LIMIT,
            wrapper,
            instrumentation,
            failsafe,
        }
    }

    /// Submits a task, returning `false` when the queue is full and the
    /// task was discarded.
    pub fn submit<F>(&self, label: &'static str, task: F) -> bool
    where
        F: FnOnce() -> Result<(), StoreError> + Send + 'static,
    {
        if self.pool.queued_count() >= self.queue_limit {
            debug!(label, "background queue full; task discarded");
            return false;
        }

        let wrapper = self.wrapper.clone();
        let instrumentation = self.instrumentation;
        let failsafe = self.failsafe.clone();

        self.pool.execute(move || {
            let body = move || {
                let outcome = std::panic::catch_unwind(AssertUnwindSafe(task));
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => failsafe.report_async(&err),
                    Err(_) => failsafe.report_async(&StoreError::Transient(format!(
                        "background task '{label}' panicked"
                    ))),
                }
            };

            let body: Box<dyn FnOnce() + Send> = if instrumentation {
                Box::new(body)
            } else {
                // 關閉 instrumentation 時，整個任務在無 subscriber 的情況下執行。
                Box::new(move || {
                    tracing::subscriber::with_default(
                        tracing::subscriber::NoSubscriber::default(),
                        body,
                    );
                })
            };

            match wrapper {
                Some(wrap) => wrap(body),
                None => body(),
            }
        });
        true
    }

    /// Blocks until every queued task has run. Intended for shutdown and
    /// tests; the steady-state engine never waits on background work.
    pub fn join(&self) {
        self.pool.join();
    }
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("queued", &self.pool.queued_count())
            .field("queue_limit", &self.queue_limit)
            .field("wrapper", &self.wrapper.is_some())
            .field("instrumentation", &self.instrumentation)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc::channel;
    use std::time::Duration;

    use crate::failsafe::{ErrorHandler, FailsafeTag};

    use super::*;

    fn executor() -> Executor {
        Executor::new(None, true, Failsafe::new(None))
    }

    #[test]
    fn submitted_task_runs() {
        let executor = executor();
        let (tx, rx) = channel();
        assert!(executor.submit("test", move || {
            tx.send(42).ok();
            Ok(())
        }));
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
    }

    #[test]
    fn overflow_discards_instead_of_blocking() {
        let executor = executor();
        let (gate_tx, gate_rx) = channel::<()>();

        // 佔住唯一的 worker，讓後續任務全部排進佇列。
        assert!(executor.submit("blocker", move || {
            gate_rx.recv().ok();
            Ok(())
        }));

        let mut accepted = 0;
        let mut discarded = 0;
        for _ in 0..QUEUE_LIMIT + 50 {
            if executor.submit("filler", || Ok(())) {
                accepted += 1;
            } else {
                discarded += 1;
            }
        }
        assert!(discarded > 0, "queue bound must discard excess tasks");
        // Worker 可能已把 blocker 從佇列撿走，接受數允許差一。
        assert!(
            accepted >= QUEUE_LIMIT - 1,
            "queue should fill before discarding, accepted only {accepted}"
        );

        gate_tx.send(()).ok();
        executor.join();
    }

    #[test]
    fn task_error_reaches_handler_with_async_tag() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler: ErrorHandler = Arc::new(move |tag, _err, _| {
            assert_eq!(tag, FailsafeTag::Async);
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let executor = Executor::new(None, true, Failsafe::new(Some(handler)));
        executor.submit("failing", || Err(StoreError::Transient("boom".into())));
        executor.join();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_task_does_not_kill_the_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let handler: ErrorHandler = Arc::new(move |_, _, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        });

        let executor = Executor::new(None, true, Failsafe::new(Some(handler)));
        executor.submit("panicking", || panic!("boom"));
        executor.join();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Worker 還活著，後續任務照常執行。
        let (tx, rx) = channel();
        executor.submit("after", move || {
            tx.send(()).ok();
            Ok(())
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn wrapper_runs_around_task() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let wrap_order = Arc::clone(&order);
        let wrapper: TaskWrapper = Arc::new(move |task| {
            wrap_order.lock().unwrap().push("enter");
            task();
            wrap_order.lock().unwrap().push("exit");
        });

        let executor = Executor::new(Some(wrapper), true, Failsafe::new(None));
        let task_order = Arc::clone(&order);
        executor.submit("wrapped", move || {
            task_order.lock().unwrap().push("task");
            Ok(())
        });
        executor.join();

        assert_eq!(order.lock().unwrap().as_slice(), &["enter", "task", "exit"]);
    }
}
