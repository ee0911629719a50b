//! SQL statements prepared once at open and reused from the statement cache

/// Upsert keyed by `(thread_id, id)`; `text` and `thread_id` keep their first value
pub(crate) const ADD_MESSAGE: &str = r#"
    INSERT INTO message (box, date, id, metadata, read, sender, text, thread_id)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
    ON CONFLICT(thread_id, id) DO UPDATE SET
        box = excluded.box,
        date = excluded.date,
        metadata = excluded.metadata,
        read = excluded.read,
        sender = excluded.sender
"#;

pub(crate) const REMOVE_MESSAGE: &str = "DELETE FROM message WHERE id = ?1";

pub(crate) const REMOVE_THREAD: &str = "DELETE FROM message WHERE thread_id = ?1";

/// Newest message of each thread whose text matches a LIKE pattern
pub(crate) const FIND_MESSAGES: &str = r#"
    SELECT * FROM message
    WHERE (thread_id, date) IN (
        SELECT thread_id, MAX(date) FROM message
        WHERE text LIKE ?1
        GROUP BY thread_id
    )
"#;

pub(crate) const GET_MESSAGE: &str = "SELECT * FROM message WHERE id = ?1";

pub(crate) const GET_THREAD: &str =
    "SELECT * FROM message WHERE thread_id = ?1 ORDER BY date ASC";

pub(crate) const GET_THREAD_DATE: &str =
    "SELECT date FROM message WHERE thread_id = ?1 ORDER BY date DESC LIMIT 1";

pub(crate) const GET_THREAD_ITEMS: &str =
    "SELECT date, id, sender FROM message WHERE thread_id = ?1 ORDER BY date ASC";

/// Newest message of every thread, newest thread first
pub(crate) const GET_SUMMARY: &str = r#"
    SELECT * FROM message
    WHERE (thread_id, date) IN (
        SELECT thread_id, MAX(date) FROM message
        GROUP BY thread_id
    )
    ORDER BY date DESC
"#;

pub(crate) const ALL: [&str; 9] = [
    ADD_MESSAGE,
    REMOVE_MESSAGE,
    REMOVE_THREAD,
    FIND_MESSAGES,
    GET_MESSAGE,
    GET_THREAD,
    GET_THREAD_DATE,
    GET_THREAD_ITEMS,
    GET_SUMMARY,
];

// Thread hydration and change notification helpers

pub(crate) const GET_THREAD_MESSAGE: &str =
    "SELECT * FROM message WHERE thread_id = ?1 AND id = ?2";

pub(crate) const GET_ROW: &str = "SELECT * FROM message WHERE rowid = ?1";

pub(crate) const DOOMED_BY_ID: &str = "SELECT rowid, thread_id, id FROM message WHERE id = ?1";

pub(crate) const DOOMED_BY_THREAD: &str =
    "SELECT rowid, thread_id, id FROM message WHERE thread_id = ?1";
