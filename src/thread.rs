//! MessageThread - virtual, date-ordered view over one conversation
//!
//! The view starts empty, fills with skeletons (`id`, `date`, `sender`) once
//! the initial item request resolves, and hydrates each entry with its full
//! record the first time it is read. Store events for the same thread keep
//! it current for as long as a handle is alive.

use crate::db::{StoreError, StoreInner, StoreResult};
use crate::dispatch::Dispatch;
use crate::events::{HandlerId, Handlers, ItemsChanged, StoreEvent};
use crate::message::{Message, ThreadItem};
use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound::{Excluded, Unbounded};
use std::rc::{Rc, Weak};
use tokio_util::sync::CancellationToken;

/// Orders entries by date; equal dates keep insertion order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct EntryKey {
    date: i64,
    seq: u64,
}

struct Entry {
    message: Message,
    /// Only `id`, `date` and `sender` are known
    skeleton: bool,
}

type Entries = BTreeMap<EntryKey, Entry>;

/// Live list of the messages in one thread, oldest first
#[derive(Clone)]
pub struct MessageThread {
    inner: Rc<ThreadInner>,
}

pub(crate) struct ThreadInner {
    id: i64,
    store: Weak<StoreInner>,
    cancellable: CancellationToken,
    loaded: Cell<bool>,
    entries: RefCell<Entries>,
    next_seq: Cell<u64>,
    /// Last position served and its key
    cursor: Cell<Option<(usize, EntryKey)>>,
    hydrating: RefCell<HashSet<i64>>,
    handlers: Handlers<ItemsChanged>,
}

impl MessageThread {
    pub(crate) fn new(store: &Rc<StoreInner>, id: i64) -> Self {
        let inner = Rc::new(ThreadInner {
            id,
            store: Rc::downgrade(store),
            cancellable: CancellationToken::new(),
            loaded: Cell::new(false),
            entries: RefCell::new(BTreeMap::new()),
            next_seq: Cell::new(0),
            cursor: Cell::new(None),
            hydrating: RefCell::new(HashSet::new()),
            handlers: Handlers::new(),
        });

        store.request(
            Some(&inner.cancellable),
            move |backend| backend.get_thread_items(id),
            move |result| Dispatch::ThreadItems {
                thread_id: id,
                result,
            },
        );

        Self { inner }
    }

    pub(crate) fn from_inner(inner: Rc<ThreadInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<ThreadInner> {
        Rc::downgrade(&self.inner)
    }

    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Number of entries currently materialized
    pub fn len(&self) -> usize {
        self.inner.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the initial item request has resolved
    pub fn is_loaded(&self) -> bool {
        self.inner.loaded.get()
    }

    /// Message at `position`, oldest first.
    ///
    /// A skeleton entry is returned as-is and a fetch of its full record is
    /// started; the entry is updated in place and `items-changed` fires once
    /// the record arrives.
    pub fn item_at(&self, position: usize) -> Option<Message> {
        let (message, skeleton) = {
            let entries = self.inner.entries.borrow();
            let key = self.inner.seek(&entries, position)?;
            let entry = entries.get(&key)?;
            (entry.message.clone(), entry.skeleton)
        };

        if skeleton {
            self.inner.hydrate(message.id);
        }
        Some(message)
    }

    /// The newest entry, hydrated like any other read
    pub fn latest_message(&self) -> Option<Message> {
        self.len().checked_sub(1).and_then(|last| self.item_at(last))
    }

    /// Snapshot of every entry in order, without triggering hydration
    pub fn to_vec(&self) -> Vec<Message> {
        self.inner
            .entries
            .borrow()
            .values()
            .map(|entry| entry.message.clone())
            .collect()
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

    pub fn ptr_eq(&self, other: &MessageThread) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl ThreadInner {
    /// Resolve a position, stepping from the cursor when adjacent
    fn seek(&self, entries: &Entries, position: usize) -> Option<EntryKey> {
        let stepped = match self.cursor.get() {
            Some((last, key)) if last == position => Some(key),
            Some((last, key)) if last.checked_add(1) == Some(position) => entries
                .range((Excluded(key), Unbounded))
                .next()
                .map(|(key, _)| *key),
            Some((last, key)) if position.checked_add(1) == Some(last) => {
                entries.range(..key).next_back().map(|(key, _)| *key)
            }
            _ => None,
        };

        let key = stepped.or_else(|| entries.keys().nth(position).copied());
        self.cursor.set(key.map(|key| (position, key)));
        key
    }

    fn next_key(&self, date: i64) -> EntryKey {
        let seq = self.next_seq.get();
        self.next_seq.set(seq + 1);
        EntryKey { date, seq }
    }

    fn hydrate(&self, id: i64) {
        if !self.hydrating.borrow_mut().insert(id) {
            return;
        }

        let Some(store) = self.store.upgrade() else {
            log::debug!("Store gone, cannot load message {} of thread {}", id, self.id);
            self.hydrating.borrow_mut().remove(&id);
            return;
        };

        let thread_id = self.id;
        store.request(
            Some(&self.cancellable),
            move |backend| backend.get_thread_message(thread_id, id),
            move |result| Dispatch::Hydrated {
                thread_id,
                id,
                result,
            },
        );
    }

    pub(crate) fn load_items(&self, result: StoreResult<Vec<ThreadItem>>) {
        let items = match result {
            Ok(items) => items,
            Err(StoreError::Cancelled) => return,
            Err(e) => {
                log::warn!("Failed to load thread {}: {}", self.id, e);
                return;
            }
        };

        let (removed, added) = {
            let mut entries = self.entries.borrow_mut();
            let removed = entries.len();
            entries.clear();
            for item in items {
                let key = self.next_key(item.date);
                entries.insert(
                    key,
                    Entry {
                        message: item.into_message(self.id),
                        skeleton: true,
                    },
                );
            }
            (removed, entries.len())
        };

        log::debug!("Loaded {} items of thread {}", added, self.id);
        self.loaded.set(true);
        self.cursor.set(None);
        self.handlers.emit(0, removed, added);
    }

    pub(crate) fn hydrated(&self, id: i64, result: StoreResult<Option<Message>>) {
        self.hydrating.borrow_mut().remove(&id);

        match result {
            Ok(Some(message)) => {
                self.update_entry(message);
            }
            Ok(None) => log::debug!("Message {} of thread {} no longer exists", id, self.id),
            Err(StoreError::Cancelled) => {}
            Err(e) => log::warn!("Failed to load message {} of thread {}: {}", id, self.id, e),
        }
    }

    pub(crate) fn handle_event(&self, event: &StoreEvent) {
        if event.thread_id() != self.id {
            return;
        }

        match event {
            StoreEvent::Added(message) | StoreEvent::Changed(message) => {
                if !self.update_entry(message.clone()) {
                    self.insert(message.clone());
                }
            }
            StoreEvent::Removed(message) => self.remove(message.id),
        }
    }

    fn insert(&self, message: Message) {
        let position = {
            let mut entries = self.entries.borrow_mut();
            let key = self.next_key(message.date);
            entries.insert(
                key,
                Entry {
                    message,
                    skeleton: false,
                },
            );
            entries.range(..key).count()
        };

        self.cursor.set(None);
        self.handlers.emit(position, 0, 1);
    }

    /// Update the entry with the same id in place; `false` if there is none
    fn update_entry(&self, message: Message) -> bool {
        let changes = {
            let mut entries = self.entries.borrow_mut();
            let Some((position, key)) = find_entry(&entries, message.id) else {
                return false;
            };

            if key.date == message.date {
                if let Some(entry) = entries.get_mut(&key) {
                    entry.message.update(message);
                    entry.skeleton = false;
                }
                vec![(position, 1, 1)]
            } else {
                let Some(mut entry) = entries.remove(&key) else {
                    return false;
                };
                entry.message.update(message);
                entry.skeleton = false;

                let key = self.next_key(entry.message.date);
                entries.insert(key, entry);
                vec![(position, 1, 0), (entries.range(..key).count(), 0, 1)]
            }
        };

        self.cursor.set(None);
        for (position, removed, added) in changes {
            self.handlers.emit(position, removed, added);
        }
        true
    }

    /// Entries are matched on `id` alone; the view holds a single thread
    fn remove(&self, id: i64) {
        let position = {
            let mut entries = self.entries.borrow_mut();
            let Some((position, key)) = find_entry(&entries, id) else {
                return;
            };
            entries.remove(&key);
            position
        };

        self.cursor.set(None);
        self.handlers.emit(position, 1, 0);
    }
}

impl Drop for ThreadInner {
    fn drop(&mut self) {
        self.cancellable.cancel();
    }
}

fn find_entry(entries: &Entries, id: i64) -> Option<(usize, EntryKey)> {
    entries
        .iter()
        .enumerate()
        .find(|(_, (_, entry))| entry.message.id == id)
        .map(|(position, (key, _))| (position, *key))
}
