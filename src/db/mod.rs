//! Database module for the SMS store
//!
//! `Store` is the public handle to one SQLite message database. All SQL runs
//! on a private worker thread; the handle itself lives on the thread that
//! created it, where results and change events are delivered.
//!
//! Features:
//! - Upsert keyed by `(thread_id, id)` with per-message change events
//! - Newest-per-thread summary and substring search
//! - Live thread views with lazy hydration
//! - Cancellation of queued operations and orderly shutdown

mod backend;
mod statements;

#[cfg(test)]
mod tests;

use crate::config::StoreConfig;
use crate::dispatch::{Dispatch, MainContext};
use crate::events::{HandlerId, Handlers, StoreEvent};
use crate::message::{Message, ThreadItem};
use crate::queue::{Reply, TaskMode, TaskQueue};
use crate::summary::{Summary, SummaryInner};
use crate::thread::{MessageThread, ThreadInner};
use backend::Backend;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How long `get_thread_date` waits for dispatches between reply checks
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Store error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Message store is closed")]
    Closed,

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("SQLite error {code}: {message}")]
    Engine { code: i32, message: String },

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(error: rusqlite::Error) -> Self {
        match error {
            rusqlite::Error::SqliteFailure(failure, message) => StoreError::Engine {
                code: failure.extended_code,
                message: message.unwrap_or_else(|| failure.to_string()),
            },
            other => StoreError::Engine {
                code: rusqlite::ffi::SQLITE_ERROR,
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        StoreError::Io(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// Store
// ============================================================================

/// Handle to a message database
///
/// Operations are queued when called and run in call order. Each returns a
/// future that resolves on the calling thread; before it does, every change
/// event raised so far is delivered to the summary, live threads and
/// connected handlers.
#[derive(Clone)]
pub struct Store {
    inner: Rc<StoreInner>,
}

pub(crate) struct StoreInner {
    config: StoreConfig,
    queue: TaskQueue<Backend>,
    context: MainContext,
    handlers: Handlers<dyn Fn(&StoreEvent)>,
    summary: RefCell<Weak<SummaryInner>>,
    threads: RefCell<HashMap<i64, Weak<ThreadInner>>>,
}

impl Store {
    /// Create a store and start opening its database.
    ///
    /// A failed open is logged and leaves the store closed for good.
    pub fn new(config: StoreConfig) -> Self {
        let context = MainContext::new();
        let backend = Backend::new(config.location.clone(), context.sender());
        let queue = TaskQueue::new(&config.thread_name, backend);

        queue.run(
            TaskMode::Critical,
            None,
            Reply::Callback(Box::new(|result: StoreResult<()>| {
                if let Err(e) = result {
                    log::error!("Failed to open message store: {}", e);
                }
            })),
            |backend: &mut Backend| backend.open(),
        );

        Self {
            inner: Rc::new(StoreInner {
                config,
                queue,
                context,
                handlers: Handlers::new(),
                summary: RefCell::new(Weak::new()),
                threads: RefCell::new(HashMap::new()),
            }),
        }
    }

    /// Database file, if not in memory
    pub fn path(&self) -> Option<&Path> {
        self.inner.config.path()
    }

    /// Whether new operations are being refused
    pub fn is_closed(&self) -> bool {
        self.inner.queue.is_closed()
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Add or update one message
    pub fn add_message(
        &self,
        message: Message,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<bool>> + '_ {
        let rx = self.inner.submit(cancellable, move |backend| {
            backend.add_messages(std::slice::from_ref(&message), &AtomicUsize::new(0))
        });
        self.inner.complete(rx)
    }

    /// Add or update messages in order.
    ///
    /// On failure `messages` is truncated to the prefix that was written.
    pub fn add_messages<'a>(
        &'a self,
        messages: &'a mut Vec<Message>,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<bool>> + 'a {
        let applied = Arc::new(AtomicUsize::new(0));
        let batch = messages.clone();
        let progress = Arc::clone(&applied);
        let rx = self.inner.submit(cancellable, move |backend| {
            backend.add_messages(&batch, &progress)
        });

        async move {
            let result = self.inner.complete(rx).await;
            if result.is_err() {
                messages.truncate(applied.load(Ordering::SeqCst));
            }
            result
        }
    }

    /// Remove every message with `id`
    pub fn remove_message(
        &self,
        id: i64,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<bool>> + '_ {
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.remove_message(id));
        self.inner.complete(rx)
    }

    /// Remove every message of a thread
    pub fn remove_thread(
        &self,
        thread_id: i64,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<bool>> + '_ {
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.remove_thread(thread_id));
        self.inner.complete(rx)
    }

    // =========================================================================
    // READS
    // =========================================================================

    /// Newest message of each thread whose text contains `query`.
    ///
    /// Matching is case-sensitive; `%` and `_` act as LIKE wildcards.
    pub fn find_messages(
        &self,
        query: &str,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<Vec<Message>>> + '_ {
        let query = query.to_string();
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.find_messages(&query));
        self.inner.complete(rx)
    }

    pub fn get_message(
        &self,
        id: i64,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<Option<Message>>> + '_ {
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.get_message(id));
        self.inner.complete(rx)
    }

    /// `(date, id, sender)` skeletons of a thread, oldest first
    pub fn get_thread_items(
        &self,
        thread_id: i64,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<Vec<ThreadItem>>> + '_ {
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.get_thread_items(thread_id));
        self.inner.complete(rx)
    }

    /// Every message of a thread, oldest first
    pub fn get_thread_messages(
        &self,
        thread_id: i64,
        cancellable: Option<&CancellationToken>,
    ) -> impl Future<Output = StoreResult<Vec<Message>>> + '_ {
        let rx = self
            .inner
            .submit(cancellable, move |backend| backend.get_thread(thread_id));
        self.inner.complete(rx)
    }

    /// Date of the newest message in a thread.
    ///
    /// Blocks the calling thread, dispatching pending work while it waits.
    /// Returns 0 for an empty thread or on failure.
    pub fn get_thread_date(&self, thread_id: i64) -> i64 {
        let mut rx = self
            .inner
            .submit(None, move |backend| backend.get_thread_date(thread_id));

        let result = loop {
            match rx.try_recv() {
                Ok(result) => break result,
                Err(oneshot::error::TryRecvError::Empty) => {
                    self.inner.iteration(PUMP_INTERVAL);
                }
                Err(oneshot::error::TryRecvError::Closed) => break Err(StoreError::Closed),
            }
        };
        self.inner.dispatch_pending();

        result.unwrap_or_else(|e| {
            log::warn!("Failed to get date of thread {}: {}", thread_id, e);
            0
        })
    }

    /// The live summary; repeated calls share one instance while it is alive
    pub fn get_summary(&self) -> Summary {
        let existing = self.inner.summary.borrow().upgrade();
        if let Some(inner) = existing {
            return Summary::from_inner(inner);
        }

        let summary = Summary::new(&self.inner);
        *self.inner.summary.borrow_mut() = summary.downgrade();
        summary
    }

    /// The live view of a thread; repeated calls share one instance while it is alive
    pub fn get_thread(&self, thread_id: i64) -> MessageThread {
        let existing = self.inner.live_thread(thread_id);
        if let Some(inner) = existing {
            return MessageThread::from_inner(inner);
        }

        let thread = MessageThread::new(&self.inner, thread_id);
        let mut threads = self.inner.threads.borrow_mut();
        threads.retain(|_, weak| weak.strong_count() > 0);
        threads.insert(thread_id, thread.downgrade());
        drop(threads);

        thread
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Resolves once everything queued before it has run and been dispatched
    pub fn flush(&self) -> impl Future<Output = StoreResult<()>> + '_ {
        let rx = self.inner.submit(None, |_: &mut Backend| Ok(()));
        self.inner.complete(rx)
    }

    /// Cancel queued operations, then close the database.
    ///
    /// Operations requested afterwards fail with [`StoreError::Closed`].
    pub fn close(&self) -> impl Future<Output = StoreResult<()>> + '_ {
        let (tx, rx) = oneshot::channel();
        self.inner
            .queue
            .close(None, Reply::Caller(tx), |backend: &mut Backend| backend.close());
        self.inner.complete(rx)
    }

    // =========================================================================
    // EVENTS
    // =========================================================================

    /// Call `handler` for every committed change
    pub fn connect(&self, handler: impl Fn(&StoreEvent) + 'static) -> HandlerId {
        self.inner.handlers.connect(Rc::new(handler))
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.inner.handlers.disconnect(id)
    }

    /// Deliver everything the worker has posted so far, without blocking
    pub fn dispatch_pending(&self) -> usize {
        self.inner.dispatch_pending()
    }

    /// Wait up to `timeout` for one posted item and deliver it
    pub fn iteration(&self, timeout: Duration) -> bool {
        self.inner.iteration(timeout)
    }
}

impl StoreInner {
    pub(crate) fn submit<T, F>(
        &self,
        cancellable: Option<&CancellationToken>,
        func: F,
    ) -> oneshot::Receiver<StoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend) -> StoreResult<T> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.queue.run(
            TaskMode::Sequential,
            cancellable.cloned(),
            Reply::Caller(tx),
            func,
        );
        rx
    }

    /// Queue `func` and post its result back to this thread as a dispatch
    pub(crate) fn request<T, F, D>(
        &self,
        cancellable: Option<&CancellationToken>,
        func: F,
        deliver: D,
    ) where
        T: Send + 'static,
        F: FnOnce(&mut Backend) -> StoreResult<T> + Send + 'static,
        D: FnOnce(StoreResult<T>) -> Dispatch + Send + 'static,
    {
        let events = self.context.sender();
        self.queue.run(
            TaskMode::Sequential,
            cancellable.cloned(),
            Reply::Callback(Box::new(move |result: StoreResult<T>| {
                events.post(deliver(result))
            })),
            func,
        );
    }

    async fn complete<T>(&self, rx: oneshot::Receiver<StoreResult<T>>) -> StoreResult<T> {
        let result = rx.await.unwrap_or(Err(StoreError::Closed));
        self.dispatch_pending();
        result
    }

    fn dispatch_pending(&self) -> usize {
        let mut count = 0;
        while let Some(dispatch) = self.context.try_next() {
            self.dispatch(dispatch);
            count += 1;
        }
        count
    }

    fn iteration(&self, timeout: Duration) -> bool {
        match self.context.next_timeout(timeout) {
            Some(dispatch) => {
                self.dispatch(dispatch);
                true
            }
            None => false,
        }
    }

    fn dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Event(event) => self.emit(&event),
            Dispatch::ThreadItems { thread_id, result } => {
                if let Some(thread) = self.live_thread(thread_id) {
                    thread.load_items(result);
                }
            }
            Dispatch::Hydrated {
                thread_id,
                id,
                result,
            } => {
                if let Some(thread) = self.live_thread(thread_id) {
                    thread.hydrated(id, result);
                }
            }
            Dispatch::Summary(result) => {
                if let Some(summary) = self.live_summary() {
                    summary.load(result);
                }
            }
            Dispatch::SummaryRefresh { thread_id, result } => {
                if let Some(summary) = self.live_summary() {
                    summary.refreshed(thread_id, result);
                }
            }
        }
    }

    /// Views first, then connected handlers
    fn emit(&self, event: &StoreEvent) {
        if let Some(summary) = self.live_summary() {
            summary.handle_event(event);
        }
        if let Some(thread) = self.live_thread(event.thread_id()) {
            thread.handle_event(event);
        }
        for handler in self.handlers.snapshot() {
            handler(event);
        }
    }

    fn live_summary(&self) -> Option<Rc<SummaryInner>> {
        self.summary.borrow().upgrade()
    }

    fn live_thread(&self, thread_id: i64) -> Option<Rc<ThreadInner>> {
        self.threads.borrow().get(&thread_id).and_then(Weak::upgrade)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        if self.queue.is_closed() {
            return;
        }

        self.queue.close(
            None,
            Reply::Callback(Box::new(|result: StoreResult<()>| {
                if let Err(e) = result {
                    log::warn!("Failed to close message store: {}", e);
                }
            })),
            |backend: &mut Backend| backend.close(),
        );
    }
}
