//! Worker to owning-thread handoff
//!
//! The worker never touches views or handlers directly. It posts
//! [`Dispatch`] values into an unbounded channel that the thread owning the
//! store drains, preserving the order they were posted in.

use crate::db::StoreResult;
use crate::events::StoreEvent;
use crate::message::{Message, ThreadItem};
use std::sync::mpsc;
use std::time::Duration;

/// Work to be completed on the owning thread
#[derive(Debug)]
pub(crate) enum Dispatch {
    Event(StoreEvent),
    ThreadItems {
        thread_id: i64,
        result: StoreResult<Vec<ThreadItem>>,
    },
    Hydrated {
        thread_id: i64,
        id: i64,
        result: StoreResult<Option<Message>>,
    },
    Summary(StoreResult<Vec<Message>>),
    SummaryRefresh {
        thread_id: i64,
        result: StoreResult<Option<Message>>,
    },
}

/// Cloneable posting end, usable from any thread
#[derive(Clone)]
pub(crate) struct DispatchSender {
    tx: mpsc::Sender<Dispatch>,
}

impl DispatchSender {
    pub(crate) fn post(&self, dispatch: Dispatch) {
        if let Err(e) = self.tx.send(dispatch) {
            log::debug!("Owning thread is gone, dropping {:?}", e.0);
        }
    }
}

/// Receiving end, owned by the thread that created the store
pub(crate) struct MainContext {
    tx: mpsc::Sender<Dispatch>,
    rx: mpsc::Receiver<Dispatch>,
}

impl MainContext {
    pub(crate) fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }

    pub(crate) fn sender(&self) -> DispatchSender {
        DispatchSender {
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn try_next(&self) -> Option<Dispatch> {
        self.rx.try_recv().ok()
    }

    pub(crate) fn next_timeout(&self, timeout: Duration) -> Option<Dispatch> {
        self.rx.recv_timeout(timeout).ok()
    }
}
