//! Store events and handler registries

use crate::message::Message;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// A committed change to the `message` table
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    Added(Message),
    Changed(Message),
    /// Carries only `id` and `thread_id` of the deleted row
    Removed(Message),
}

impl StoreEvent {
    pub fn message(&self) -> &Message {
        match self {
            StoreEvent::Added(message)
            | StoreEvent::Changed(message)
            | StoreEvent::Removed(message) => message,
        }
    }

    pub fn thread_id(&self) -> i64 {
        self.message().thread_id
    }
}

/// Identifies a connected handler for later disconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

/// Callback list for single-threaded emission.
///
/// Emission works on a snapshot, so handlers may connect or disconnect
/// while being called.
pub(crate) struct Handlers<F: ?Sized> {
    next_id: Cell<u64>,
    entries: RefCell<Vec<(HandlerId, Rc<F>)>>,
}

impl<F: ?Sized> Handlers<F> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: Cell::new(1),
            entries: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn connect(&self, handler: Rc<F>) -> HandlerId {
        let id = HandlerId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        self.entries.borrow_mut().push((id, handler));
        id
    }

    pub(crate) fn disconnect(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.borrow_mut();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    pub(crate) fn snapshot(&self) -> Vec<Rc<F>> {
        self.entries
            .borrow()
            .iter()
            .map(|(_, handler)| Rc::clone(handler))
            .collect()
    }
}

/// `(position, removed, added)` list-model notification
pub(crate) type ItemsChanged = dyn Fn(usize, usize, usize);

impl Handlers<ItemsChanged> {
    pub(crate) fn emit(&self, position: usize, removed: usize, added: usize) {
        if removed == 0 && added == 0 {
            return;
        }
        for handler in self.snapshot() {
            handler(position, removed, added);
        }
    }
}
