// Copyright 2025 Xpan project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;

///
/// Executors come in two flavors:
/// * "borrowed"
///     * Created with `Self::new()`.
///     * A borrowed Executor will not be shut down when all handles are dropped, and shutdown
///       methods will have no impact. Used in unit tests where the Runtime is created by macros.
/// * "owned"
///     * Created with `Self::new_owned()`.
///     * When all handles of an owned Executor are dropped, its Runtime will be shut down.
///       Additionally, the explicit shutdown method can be used to shut down the Executor for
///       all clones.
///
#[derive(Debug, Clone)]
pub struct Executor {
    runtime: Arc<Mutex<Option<Runtime>>>,
    handle: Handle,
}

impl Executor {
    ///
    /// Creates an Executor for an existing tokio::Runtime (generally provided by tokio's macros).
    ///
    /// The returned Executor will have a lifecycle independent of the Runtime, meaning that
    /// dropping all clones of the Executor will not cause the Runtime to be shut down.
    ///
    pub fn new() -> Executor {
        Self {
            runtime: Arc::new(Mutex::new(None)),
            handle: Handle::current(),
        }
    }

    ///
    /// Creates an Executor with an owned tokio::Runtime, using the given thread configuration.
    ///
    pub fn new_owned(num_worker_threads: usize, max_threads: usize) -> Result<Executor, String> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(num_worker_threads)
            .max_blocking_threads(max_threads.saturating_sub(num_worker_threads).max(1))
            .enable_all()
            .build()
            .map_err(|e| format!("Failed to start the runtime: {e}"))?;

        let handle = runtime.handle().clone();
        Ok(Executor {
            runtime: Arc::new(Mutex::new(Some(runtime))),
            handle,
        })
    }

    ///
    /// Run a Future on a tokio Runtime as a new Task, and return a Future handle to it.
    ///
    /// If the background Task exits abnormally, the given closure will be called to recover:
    /// usually it should convert the resulting Error to a relevant error type.
    ///
    pub fn spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
        rescue_join_error: impl FnOnce(JoinError) -> O,
    ) -> impl Future<Output = O> {
        self.native_spawn(future).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Run a Future on a tokio Runtime as a new Task, and return a JoinHandle.
    ///
    pub fn native_spawn<O: Send + 'static, F: Future<Output = O> + Send + 'static>(
        &self,
        future: F,
    ) -> JoinHandle<O> {
        self.handle.spawn(future)
    }

    ///
    /// Run a Future and return its resolved Result.
    ///
    /// This should never be called from in a Future context, and should only ever be called in
    /// something that resembles a main method.
    ///
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.handle.block_on(future)
    }

    ///
    /// Spawn a closure on a threadpool specifically reserved for I/O tasks which are allowed to
    /// be long-running.
    ///
    pub fn spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
        rescue_join_error: impl FnOnce(JoinError) -> R,
    ) -> impl Future<Output = R> {
        self.native_spawn_blocking(f).map(|res| match res {
            Ok(o) => o,
            Err(e) => rescue_join_error(e),
        })
    }

    ///
    /// Spawn a closure on threads specifically reserved for I/O tasks and return a JoinHandle.
    ///
    pub fn native_spawn_blocking<F: FnOnce() -> R + Send + 'static, R: Send + 'static>(
        &self,
        f: F,
    ) -> JoinHandle<R> {
        self.handle.spawn_blocking(f)
    }

    /// Return a reference to this executor's runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    ///
    /// A blocking call to shut down the Runtime associated with this "owned" Executor. If tasks
    /// do not shut down within the given timeout, they are leaked.
    ///
    /// This method has no effect for "borrowed" Executors: see the `Executor` rustdoc.
    ///
    pub fn shutdown(&self, timeout: Duration) {
        let Some(runtime) = self.runtime.lock().take() else {
            return;
        };

        let start = Instant::now();
        runtime.shutdown_timeout(timeout + Duration::from_millis(250));
        if start.elapsed() > timeout {
            log::warn!("Executor shutdown took unexpectedly long: tasks were likely leaked!");
        }
    }

    /// Returns true if `shutdown` has been called for this Executor. Always returns true for
    /// borrowed Executors.
    pub fn is_shutdown(&self) -> bool {
        self.runtime.lock().is_none()
    }
}

///
/// The terminal state of a `WorkerPool::run` call that did not complete every task.
///
#[derive(Debug)]
pub enum RunError<E> {
    /// The shared cancellation signal fired before all tasks completed.
    Cancelled,
    /// A task failed. Only the first failure is captured; the rest were cancelled.
    Failed(E),
}

impl<E: fmt::Display> fmt::Display for RunError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Cancelled => write!(f, "cancelled"),
            RunError::Failed(e) => write!(f, "{e}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RunError<E> {}

///
/// A fixed-width parallel executor over an ordered task list.
///
/// * `workers` tasks run concurrently; tasks are independent and may complete out of order.
/// * Results carry their task index, and are reassembled into submission order before `run`
///   returns.
/// * The submission queue is bounded, so the producer suspends when workers fall behind.
/// * The first task error cancels submission and all in-flight work (at its next suspension
///   point); the pool drains fully before `run` returns.
///
pub struct WorkerPool {
    workers: usize,
    queue_depth: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> WorkerPool {
        let workers = workers.max(1);
        WorkerPool {
            workers,
            queue_depth: workers * 2,
        }
    }

    pub async fn run<T, O, E, F, Fut>(
        &self,
        executor: &Executor,
        cancel: &CancellationToken,
        tasks: Vec<T>,
        run_task: F,
    ) -> Result<Vec<O>, RunError<E>>
    where
        T: Send + 'static,
        O: Send + 'static,
        E: Send + 'static,
        F: Fn(usize, T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, E>> + Send + 'static,
    {
        let total = tasks.len();
        let run_task = Arc::new(run_task);
        // A child token, so that a task failure stops this pool without cancelling the caller.
        let cancel = cancel.child_token();

        let (task_tx, task_rx) = mpsc::channel::<(usize, T)>(self.queue_depth);
        let task_rx = Arc::new(tokio::sync::Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(usize, O)>();
        let first_error: Arc<Mutex<Option<E>>> = Arc::new(Mutex::new(None));

        let producer_cancel = cancel.clone();
        let producer = executor.native_spawn(async move {
            for (index, task) in tasks.into_iter().enumerate() {
                tokio::select! {
                    _ = producer_cancel.cancelled() => break,
                    res = task_tx.send((index, task)) => {
                        if res.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut workers = Vec::with_capacity(self.workers);
        for _ in 0..self.workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let run_task = run_task.clone();
            let first_error = first_error.clone();
            let cancel = cancel.clone();
            workers.push(executor.native_spawn(async move {
                loop {
                    let next = {
                        let mut rx = task_rx.lock().await;
                        tokio::select! {
                            _ = cancel.cancelled() => None,
                            next = rx.recv() => next,
                        }
                    };
                    let Some((index, task)) = next else {
                        break;
                    };
                    let result = tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = (*run_task)(index, task) => result,
                    };
                    match result {
                        Ok(output) => {
                            let _ = result_tx.send((index, output));
                        }
                        Err(err) => {
                            {
                                let mut slot = first_error.lock();
                                if slot.is_none() {
                                    *slot = Some(err);
                                }
                            }
                            cancel.cancel();
                            break;
                        }
                    }
                }
            }));
        }
        drop(result_tx);

        // Drain before returning, whether or not anything failed. Dropping our queue handle
        // after the workers exit closes the channel, so the producer cannot stay blocked on a
        // full queue.
        for worker in workers {
            let _ = worker.await;
        }
        drop(task_rx);
        let _ = producer.await;

        let mut outputs: Vec<Option<O>> = (0..total).map(|_| None).collect();
        while let Some((index, output)) = result_rx.recv().await {
            outputs[index] = Some(output);
        }

        if let Some(err) = first_error.lock().take() {
            return Err(RunError::Failed(err));
        }
        if cancel.is_cancelled() {
            return Err(RunError::Cancelled);
        }
        // No error and no cancellation: every worker ran the queue dry, so every slot is filled.
        Ok(outputs
            .into_iter()
            .map(|output| output.expect("all tasks completed"))
            .collect())
    }
}
