//! Summary - newest message of every thread, newest thread first

use crate::db::{StoreError, StoreInner, StoreResult};
use crate::dispatch::Dispatch;
use crate::events::{HandlerId, Handlers, ItemsChanged, StoreEvent};
use crate::message::Message;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use tokio_util::sync::CancellationToken;

/// Live list holding one message per thread
#[derive(Clone)]
pub struct Summary {
    inner: Rc<SummaryInner>,
}

pub(crate) struct SummaryInner {
    store: Weak<StoreInner>,
    cancellable: CancellationToken,
    loaded: Cell<bool>,
    items: RefCell<Vec<Message>>,
    handlers: Handlers<ItemsChanged>,
}

impl Summary {
    pub(crate) fn new(store: &Rc<StoreInner>) -> Self {
        let inner = Rc::new(SummaryInner {
            store: Rc::downgrade(store),
            cancellable: CancellationToken::new(),
            loaded: Cell::new(false),
            items: RefCell::new(Vec::new()),
            handlers: Handlers::new(),
        });

        store.request(
            Some(&inner.cancellable),
            |backend| backend.get_summary(),
            Dispatch::Summary,
        );

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<SummaryInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SummaryInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn len(&self) -> usize {
        self.inner.items.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.get()
    }

    pub fn item_at(&self, position: usize) -> Option<Message> {
        self.inner.items.borrow().get(position).cloned()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.inner.items.borrow().clone()
    }

    /// Call `handler(position, removed, added)` whenever the list changes
    pub fn connect_items_changed(
        &self,
        handler: impl Fn(usize, usize, usize) + 'static,
    ) -> HandlerId {
        self.inner.handlers.connect(Rc::new(handler))
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.inner.handlers.disconnect(id)
    }

    pub fn ptr_eq(&self, other: &Summary) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl SummaryInner {
    pub(crate) fn load(&self, result: StoreResult<Vec<Message>>) {
        let messages = match result {
            Ok(messages) => messages,
            Err(StoreError::Cancelled) => return,
            Err(e) => {
                log::warn!("Failed to load message summary: {}", e);
                return;
            }
        };

        let added = messages.len();
        let removed = std::mem::replace(&mut *self.items.borrow_mut(), messages).len();
        self.loaded.set(true);
        self.handlers.emit(0, removed, added);
    }

    pub(crate) fn handle_event(&self, event: &StoreEvent) {
        match event {
            StoreEvent::Added(message) | StoreEvent::Changed(message) => self.offer(message),
            StoreEvent::Removed(message) => self.retract(message),
        }
    }

    pub(crate) fn refreshed(&self, thread_id: i64, result: StoreResult<Option<Message>>) {
        match result {
            Ok(Some(message)) => self.offer(&message),
            Ok(None) => log::debug!("Thread {} has no messages left", thread_id),
            Err(StoreError::Cancelled) => {}
            Err(e) => log::warn!("Failed to refresh summary of thread {}: {}", thread_id, e),
        }
    }

    /// Make `message` its thread's entry unless the current entry is newer.
    ///
    /// If the entry's own date moved back, another message of the thread may
    /// now be newer, so the thread is looked up again.
    fn offer(&self, message: &Message) {
        let (changes, moved_back) = {
            let mut items = self.items.borrow_mut();
            let current = items
                .iter()
                .position(|item| item.thread_id == message.thread_id);

            let mut moved_back = false;
            if let Some(index) = current {
                let item = &items[index];
                if item.id != message.id && item.date > message.date {
                    return;
                }
                moved_back = item.id == message.id && message.date < item.date;
                items.remove(index);
            }

            let position = items
                .iter()
                .position(|item| item.date < message.date)
                .unwrap_or(items.len());
            items.insert(position, message.clone());

            let changes = match current {
                Some(index) if index == position => vec![(position, 1, 1)],
                Some(index) => vec![(index, 1, 0), (position, 0, 1)],
                None => vec![(position, 0, 1)],
            };
            (changes, moved_back)
        };

        for (position, removed, added) in changes {
            self.handlers.emit(position, removed, added);
        }

        if moved_back {
            self.refresh(message.thread_id);
        }
    }

    /// Drop a deleted entry and look up the thread's next newest message
    fn retract(&self, message: &Message) {
        let position = {
            let mut items = self.items.borrow_mut();
            let Some(position) = items
                .iter()
                .position(|item| item.thread_id == message.thread_id && item.id == message.id)
            else {
                return;
            };
            items.remove(position);
            position
        };

        self.handlers.emit(position, 1, 0);
        self.refresh(message.thread_id);
    }

    /// Ask the store for the newest message of `thread_id`
    fn refresh(&self, thread_id: i64) {
        let Some(store) = self.store.upgrade() else {
            log::debug!("Store gone, cannot refresh thread {}", thread_id);
            return;
        };

        store.request(
            Some(&self.cancellable),
            move |backend| backend.get_thread(thread_id).map(|mut messages| messages.pop()),
            move |result| Dispatch::SummaryRefresh { thread_id, result },
        );
    }
}

impl Drop for SummaryInner {
    fn drop(&mut self) {
        self.cancellable.cancel();
    }
}
