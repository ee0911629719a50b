//! Task Queue Module - Serializes work onto one dedicated thread
//!
//! Closures are queued in FIFO order and run one at a time against state
//! owned exclusively by the worker thread.
//!
//! Features:
//! - Sequential, critical and terminal execution modes
//! - Cancellation before execution (token or dropped caller)
//! - Results delivered through a oneshot channel or a callback
//! - Queue closes itself on shutdown, critical failure or spawn failure

use crate::db::{StoreError, StoreResult};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Data Types
// ============================================================================

/// How the worker reacts to the outcome of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMode {
    /// Keep draining whatever the result
    Sequential,
    /// On failure, cancel everything still queued and stop
    Critical,
    /// Run, then stop regardless of the result
    Terminal,
}

/// Where a task's result goes
pub enum Reply<T> {
    Caller(oneshot::Sender<StoreResult<T>>),
    Callback(Box<dyn FnOnce(StoreResult<T>) + Send>),
}

impl<T> Reply<T> {
    fn is_closed(&self) -> bool {
        match self {
            Reply::Caller(tx) => tx.is_closed(),
            Reply::Callback(_) => false,
        }
    }

    fn send(self, result: StoreResult<T>) {
        match self {
            Reply::Caller(tx) => {
                // The caller may have given up waiting
                let _ = tx.send(result);
            }
            Reply::Callback(callback) => callback(result),
        }
    }
}

trait Job<S>: Send {
    fn mode(&self) -> TaskMode;
    fn is_cancelled(&self) -> bool;
    /// Run against the worker state; returns `true` on success
    fn run(self: Box<Self>, state: &mut S) -> bool;
    fn cancel(self: Box<Self>, error: StoreError);
}

struct Task<S, T, F> {
    func: F,
    reply: Reply<T>,
    cancellable: Option<CancellationToken>,
    mode: TaskMode,
    _state: PhantomData<fn(&mut S)>,
}

impl<S, T, F> Job<S> for Task<S, T, F>
where
    S: 'static,
    T: Send + 'static,
    F: FnOnce(&mut S) -> StoreResult<T> + Send + 'static,
{
    fn mode(&self) -> TaskMode {
        self.mode
    }

    fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
            || self
                .cancellable
                .as_ref()
                .is_some_and(CancellationToken::is_cancelled)
    }

    fn run(self: Box<Self>, state: &mut S) -> bool {
        let task = *self;
        let result = (task.func)(state);
        let succeeded = result.is_ok();
        task.reply.send(result);
        succeeded
    }

    fn cancel(self: Box<Self>, error: StoreError) {
        self.reply.send(Err(error));
    }
}

struct Pending<S> {
    tasks: VecDeque<Box<dyn Job<S>>>,
    closed: bool,
}

struct Shared<S> {
    pending: Mutex<Pending<S>>,
    ready: Condvar,
}

impl<S> Shared<S> {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Pending {
                tasks: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending<S>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Block until a task is available
    fn pop(&self) -> Box<dyn Job<S>> {
        let mut pending = self.lock();
        loop {
            if let Some(task) = pending.tasks.pop_front() {
                return task;
            }
            pending = self.ready.wait(pending).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Close the queue and hand back everything still waiting
    fn close(&self) -> Vec<Box<dyn Job<S>>> {
        let mut pending = self.lock();
        pending.closed = true;
        pending.tasks.drain(..).collect()
    }

    /// Close a queue that has no worker, rejecting whatever was queued
    fn abandon(&self) {
        for task in self.close() {
            task.cancel(StoreError::Closed);
        }
    }
}

// ============================================================================
// Task Queue
// ============================================================================

/// FIFO queue of closures drained by a single worker thread owning `S`
pub struct TaskQueue<S: Send + 'static> {
    shared: Arc<Shared<S>>,
}

impl<S: Send + 'static> TaskQueue<S> {
    /// Spawn the worker thread, moving `state` onto it.
    ///
    /// If the thread cannot be spawned the queue starts closed.
    pub fn new(name: &str, state: S) -> Self {
        let shared = Arc::new(Shared::new());

        let worker_shared = Arc::clone(&shared);
        let spawned = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(worker_shared, state));

        if let Err(e) = spawned {
            log::error!("Failed to spawn worker thread '{}': {}", name, e);
            shared.abandon();
        }

        Self { shared }
    }

    /// Queue `func` for execution on the worker thread.
    ///
    /// A closed queue resolves `reply` with [`StoreError::Closed`] immediately.
    /// Queueing a [`TaskMode::Terminal`] task closes the queue.
    pub fn run<T, F>(
        &self,
        mode: TaskMode,
        cancellable: Option<CancellationToken>,
        reply: Reply<T>,
        func: F,
    ) where
        T: Send + 'static,
        F: FnOnce(&mut S) -> StoreResult<T> + Send + 'static,
    {
        let task = Self::task(mode, cancellable, reply, func);

        let mut pending = self.shared.lock();
        if pending.closed {
            drop(pending);
            task.cancel(StoreError::Closed);
            return;
        }

        pending.closed = mode == TaskMode::Terminal;
        pending.tasks.push_back(task);
        drop(pending);

        self.shared.ready.notify_one();
    }

    /// Cancel every queued task, then queue `func` as the terminal task.
    pub fn close<T, F>(&self, cancellable: Option<CancellationToken>, reply: Reply<T>, func: F)
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> StoreResult<T> + Send + 'static,
    {
        let task = Self::task(TaskMode::Terminal, cancellable, reply, func);

        let mut pending = self.shared.lock();
        if pending.closed {
            drop(pending);
            task.cancel(StoreError::Closed);
            return;
        }

        let cancelled: Vec<_> = pending.tasks.drain(..).collect();
        pending.closed = true;
        pending.tasks.push_back(task);
        drop(pending);

        self.shared.ready.notify_one();

        if !cancelled.is_empty() {
            log::debug!("Cancelling {} queued tasks on close", cancelled.len());
        }
        for task in cancelled {
            task.cancel(StoreError::Cancelled);
        }
    }

    /// Whether new tasks are being refused
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    fn task<T, F>(
        mode: TaskMode,
        cancellable: Option<CancellationToken>,
        reply: Reply<T>,
        func: F,
    ) -> Box<dyn Job<S>>
    where
        T: Send + 'static,
        F: FnOnce(&mut S) -> StoreResult<T> + Send + 'static,
    {
        Box::new(Task {
            func,
            reply,
            cancellable,
            mode,
            _state: PhantomData,
        })
    }
}

impl<S: Send + 'static> Drop for TaskQueue<S> {
    fn drop(&mut self) {
        let mut pending = self.shared.lock();
        if pending.closed {
            return;
        }

        // Wake the worker with a no-op so it can exit and release its state
        pending.closed = true;
        pending.tasks.push_back(Box::new(Task {
            func: |_: &mut S| -> StoreResult<()> { Ok(()) },
            reply: Reply::Callback(Box::new(|_: StoreResult<()>| {})),
            cancellable: None,
            mode: TaskMode::Terminal,
            _state: PhantomData,
        }));
        drop(pending);

        self.shared.ready.notify_one();
    }
}

fn run_loop<S>(shared: Arc<Shared<S>>, mut state: S) {
    loop {
        let task = shared.pop();
        let mut mode = task.mode();

        if task.is_cancelled() {
            task.cancel(StoreError::Cancelled);
        } else if !task.run(&mut state) && mode == TaskMode::Critical {
            log::warn!("Critical task failed, stopping worker");
            mode = TaskMode::Terminal;
        }

        if mode == TaskMode::Terminal {
            break;
        }
    }

    let remaining = shared.close();
    if !remaining.is_empty() {
        log::debug!("Cancelling {} tasks left on a stopped worker", remaining.len());
    }
    for task in remaining {
        task.cancel(StoreError::Cancelled);
    }
}
