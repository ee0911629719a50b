//! Worker-side database state
//!
//! Everything here runs on the store's worker thread: the connection, the
//! statement cache and the update hook are never touched from anywhere else.

use super::statements;
use super::{StoreError, StoreResult};
use crate::config::Location;
use crate::dispatch::{Dispatch, DispatchSender};
use crate::events::StoreEvent;
use crate::message::{Message, ThreadItem};
use rusqlite::hooks::Action;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const STATEMENT_CACHE_CAPACITY: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowAction {
    Insert,
    Update,
    Delete,
}

/// Row-level change recorded by the update hook
#[derive(Debug, Clone, Copy)]
struct RowChange {
    action: RowAction,
    rowid: i64,
}

pub(crate) struct Backend {
    location: Location,
    conn: Option<Connection>,
    changes: Arc<Mutex<Vec<RowChange>>>,
    /// `rowid -> (thread_id, id)` of rows a pending delete is about to remove
    doomed: HashMap<i64, (i64, i64)>,
    events: DispatchSender,
}

impl Backend {
    pub(crate) fn new(location: Location, events: DispatchSender) -> Self {
        Self {
            location,
            conn: None,
            changes: Arc::new(Mutex::new(Vec::new())),
            doomed: HashMap::new(),
            events,
        }
    }

    // =========================================================================
    // LIFECYCLE
    // =========================================================================

    /// Open the database, create the schema and prepare every statement
    pub(crate) fn open(&mut self) -> StoreResult<()> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX
            | OpenFlags::SQLITE_OPEN_URI;

        let conn = match &self.location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                log::info!("Opening message store at {}", path.display());
                Connection::open_with_flags(path, flags)?
            }
            Location::Memory => {
                log::info!("Opening in-memory message store");
                Connection::open_in_memory_with_flags(flags)?
            }
        };

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = OFF;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA case_sensitive_like = ON;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        conn.set_prepared_statement_cache_capacity(STATEMENT_CACHE_CAPACITY);
        for sql in statements::ALL {
            conn.prepare_cached(sql)?;
        }

        let changes = Arc::clone(&self.changes);
        conn.update_hook(Some(
            move |action: Action, _database: &str, table: &str, rowid: i64| {
                if table != "message" {
                    return;
                }
                let action = match action {
                    Action::SQLITE_INSERT => RowAction::Insert,
                    Action::SQLITE_UPDATE => RowAction::Update,
                    Action::SQLITE_DELETE => RowAction::Delete,
                    _ => return,
                };
                changes
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(RowChange { action, rowid });
            },
        ));

        self.conn = Some(conn);
        Ok(())
    }

    /// Detach the hook, release statements, optimize and close
    pub(crate) fn close(&mut self) -> StoreResult<()> {
        let conn = self.conn.take().ok_or(StoreError::Closed)?;

        conn.update_hook(None::<fn(Action, &str, &str, i64)>);
        conn.flush_prepared_statement_cache();

        if let Err(e) = conn.execute_batch("PRAGMA optimize;") {
            log::warn!("Failed to optimize message store: {}", e);
        }

        conn.close().map_err(|(_, e)| StoreError::from(e))?;
        log::info!("Message store closed");
        Ok(())
    }

    pub(crate) fn conn(&self) -> StoreResult<&Connection> {
        self.conn.as_ref().ok_or(StoreError::Closed)
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Upsert each message in order, stopping at the first failure.
    ///
    /// `applied` counts the messages written so far.
    pub(crate) fn add_messages(
        &mut self,
        messages: &[Message],
        applied: &AtomicUsize,
    ) -> StoreResult<bool> {
        for message in messages {
            let result = self.upsert(message);
            self.flush_changes();

            if let Err(e) = result {
                log::warn!(
                    "Failed to add message {} to thread {}: {}",
                    message.id,
                    message.thread_id,
                    e
                );
                return Err(e);
            }
            applied.fetch_add(1, Ordering::SeqCst);
        }

        Ok(true)
    }

    fn upsert(&self, message: &Message) -> StoreResult<()> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::ADD_MESSAGE)?;
        stmt.execute(params![
            message.message_box.as_i64(),
            message.date,
            message.id,
            message.metadata_text(),
            message.read,
            message.sender,
            message.text,
            message.thread_id,
        ])?;
        Ok(())
    }

    pub(crate) fn remove_message(&mut self, id: i64) -> StoreResult<bool> {
        self.remove(statements::DOOMED_BY_ID, statements::REMOVE_MESSAGE, id)
    }

    pub(crate) fn remove_thread(&mut self, thread_id: i64) -> StoreResult<bool> {
        self.remove(statements::DOOMED_BY_THREAD, statements::REMOVE_THREAD, thread_id)
    }

    fn remove(&mut self, snapshot: &str, delete: &str, key: i64) -> StoreResult<bool> {
        let result = self.stash_doomed(snapshot, key).and_then(|()| {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(delete)?;
            stmt.execute([key])?;
            Ok(true)
        });

        self.flush_changes();
        self.doomed.clear();
        result
    }

    /// Remember the identity of rows about to be deleted; the hook only sees rowids
    fn stash_doomed(&mut self, sql: &str, key: i64) -> StoreResult<()> {
        let doomed = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare_cached(sql)?;
            let rows = stmt.query_map([key], |row| {
                Ok((row.get::<_, i64>(0)?, (row.get(1)?, row.get(2)?)))
            })?;
            rows.collect::<rusqlite::Result<Vec<(i64, (i64, i64))>>>()?
        };

        self.doomed.extend(doomed);
        Ok(())
    }

    // =========================================================================
    // READS
    // =========================================================================

    pub(crate) fn find_messages(&self, query: &str) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::FIND_MESSAGES)?;
        let pattern = format!("%{}%", query);
        let messages = stmt
            .query_map([pattern], Message::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    pub(crate) fn get_message(&self, id: i64) -> StoreResult<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_MESSAGE)?;
        Ok(stmt.query_row([id], Message::from_row).optional()?)
    }

    /// One message of one thread, unaffected by ids reused in other threads
    pub(crate) fn get_thread_message(
        &self,
        thread_id: i64,
        id: i64,
    ) -> StoreResult<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_THREAD_MESSAGE)?;
        Ok(stmt
            .query_row(params![thread_id, id], Message::from_row)
            .optional()?)
    }

    pub(crate) fn get_thread(&self, thread_id: i64) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_THREAD)?;
        let messages = stmt
            .query_map([thread_id], Message::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    /// Newest date in a thread, 0 when the thread is empty
    pub(crate) fn get_thread_date(&self, thread_id: i64) -> StoreResult<i64> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_THREAD_DATE)?;
        let date = stmt
            .query_row([thread_id], |row| row.get::<_, i64>(0))
            .optional()?;
        Ok(date.unwrap_or(0))
    }

    pub(crate) fn get_thread_items(&self, thread_id: i64) -> StoreResult<Vec<ThreadItem>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_THREAD_ITEMS)?;
        let items = stmt
            .query_map([thread_id], ThreadItem::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(items)
    }

    pub(crate) fn get_summary(&self) -> StoreResult<Vec<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_SUMMARY)?;
        let messages = stmt
            .query_map([], Message::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    // =========================================================================
    // CHANGE NOTIFICATION
    // =========================================================================

    /// Turn the rows recorded by the update hook into store events
    fn flush_changes(&mut self) {
        let changes = std::mem::take(&mut *self.changes.lock().unwrap_or_else(|e| e.into_inner()));

        for change in changes {
            let event = match change.action {
                RowAction::Insert | RowAction::Update => match self.read_row(change.rowid) {
                    Ok(Some(message)) if change.action == RowAction::Insert => {
                        Some(StoreEvent::Added(message))
                    }
                    Ok(Some(message)) => Some(StoreEvent::Changed(message)),
                    Ok(None) => {
                        log::debug!("Changed row {} no longer exists", change.rowid);
                        None
                    }
                    Err(e) => {
                        log::warn!("Failed to read changed row {}: {}", change.rowid, e);
                        None
                    }
                },
                RowAction::Delete => match self.doomed.remove(&change.rowid) {
                    Some((thread_id, id)) => {
                        Some(StoreEvent::Removed(Message::removed(thread_id, id)))
                    }
                    None => {
                        log::warn!("Deleted row {} was not snapshotted", change.rowid);
                        None
                    }
                },
            };

            if let Some(event) = event {
                self.events.post(Dispatch::Event(event));
            }
        }
    }

    fn read_row(&self, rowid: i64) -> StoreResult<Option<Message>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(statements::GET_ROW)?;
        Ok(stmt.query_row([rowid], Message::from_row).optional()?)
    }
}
