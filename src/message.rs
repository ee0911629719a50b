//! Message entity
//!
//! Plain value types for one SMS/MMS record and the lightweight skeleton
//! used to seed thread views.

use chrono::{DateTime, Local, TimeZone};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Message Box
// ============================================================================

/// Direction/state category of a message
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageBox {
    #[default]
    All = 0,
    Inbox = 1,
    Sent = 2,
    Drafts = 3,
    Outbox = 4,
    Failed = 5,
}

impl MessageBox {
    pub fn as_i64(&self) -> i64 {
        *self as i64
    }

    /// Decode a stored value; unknown values fall back to `All`
    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Inbox,
            2 => Self::Sent,
            3 => Self::Drafts,
            4 => Self::Outbox,
            5 => Self::Failed,
            _ => Self::All,
        }
    }

    /// Whether the message originated on this side of the conversation
    pub fn is_outgoing(&self) -> bool {
        matches!(self, Self::Sent | Self::Drafts | Self::Outbox | Self::Failed)
    }
}

// ============================================================================
// Message
// ============================================================================

/// `subscription_id()` of a message without a `sub_id`
pub const UNKNOWN_SUBSCRIPTION: i64 = -1;

/// One stored message
///
/// `(thread_id, id)` identifies a row. `metadata` holds open-ended extras
/// such as the address list and attachment descriptors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "box")]
    pub message_box: MessageBox,
    pub date: i64,
    pub id: i64,
    pub metadata: Option<Value>,
    pub read: bool,
    pub sender: Option<String>,
    pub text: Option<String>,
    pub thread_id: i64,
}

impl Message {
    /// Create Message from a `SELECT * FROM message` row
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        let metadata: Option<String> = row.get(3)?;

        Ok(Message {
            message_box: MessageBox::from_i64(row.get(0)?),
            date: row.get(1)?,
            id: row.get(2)?,
            metadata: metadata.as_deref().and_then(parse_metadata),
            read: row.get(4)?,
            sender: row.get(5)?,
            text: row.get(6)?,
            thread_id: row.get(7)?,
        })
    }

    /// Minimal message carrying only identity, as reported for deleted rows
    pub fn removed(thread_id: i64, id: i64) -> Self {
        Message {
            id,
            thread_id,
            ..Default::default()
        }
    }

    /// Metadata in its persisted textual form.
    ///
    /// A string that is not itself JSON was read from a non-JSON column and
    /// is written back verbatim.
    pub fn metadata_text(&self) -> Option<String> {
        self.metadata.as_ref().map(|metadata| match metadata {
            Value::String(raw) if serde_json::from_str::<Value>(raw).is_err() => raw.clone(),
            other => other.to_string(),
        })
    }

    /// Apply the mutable fields of `update`, which must describe the same message.
    ///
    /// Returns `true` if any field changed.
    pub fn update(&mut self, update: Message) -> bool {
        if update.id != self.id {
            log::warn!(
                "Ignoring update for message {} applied to message {}",
                update.id,
                self.id
            );
            return false;
        }

        let changed = self.message_box != update.message_box
            || self.date != update.date
            || self.metadata != update.metadata
            || self.read != update.read
            || self.sender != update.sender
            || self.text != update.text;

        self.message_box = update.message_box;
        self.date = update.date;
        self.metadata = update.metadata;
        self.read = update.read;
        self.sender = update.sender;
        self.text = update.text;

        changed
    }

    /// Participant addresses listed under `metadata.addresses`
    pub fn addresses(&self) -> Vec<String> {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get("addresses"))
            .and_then(Value::as_array)
            .map(|addresses| {
                addresses
                    .iter()
                    .filter_map(|entry| entry.get("address").and_then(Value::as_str))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Addresses other than the sender
    pub fn recipients(&self) -> Vec<String> {
        let mut addresses = self.addresses();
        if let Some(sender) = &self.sender {
            addresses.retain(|address| address != sender);
        }
        addresses
    }

    /// Attachment descriptors listed under `metadata.attachments`
    pub fn attachments(&self) -> &[Value] {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get("attachments"))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// SIM subscription from `metadata.sub_id`, -1 when unknown
    pub fn subscription_id(&self) -> i64 {
        self.metadata
            .as_ref()
            .and_then(|metadata| metadata.get("sub_id"))
            .and_then(Value::as_i64)
            .unwrap_or(UNKNOWN_SUBSCRIPTION)
    }

    /// The message date in local time
    pub fn datetime(&self) -> Option<DateTime<Local>> {
        Local.timestamp_millis_opt(self.date).single()
    }
}

/// Parse stored metadata; text that is not JSON is kept as a plain string
fn parse_metadata(text: &str) -> Option<Value> {
    match serde_json::from_str(text) {
        Ok(value) => Some(value),
        Err(e) => {
            log::debug!("Keeping non-JSON message metadata as text: {}", e);
            Some(Value::String(text.to_string()))
        }
    }
}

// ============================================================================
// Thread Item
// ============================================================================

/// Skeleton of a message, enough to position it within its thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadItem {
    pub id: i64,
    pub date: i64,
    pub sender: Option<String>,
}

impl ThreadItem {
    /// Create ThreadItem from a `SELECT date, id, sender` row
    pub fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(ThreadItem {
            date: row.get(0)?,
            id: row.get(1)?,
            sender: row.get(2)?,
        })
    }

    /// Expand into a partially populated message of `thread_id`
    pub fn into_message(self, thread_id: i64) -> Message {
        Message {
            date: self.date,
            id: self.id,
            sender: self.sender,
            thread_id,
            ..Default::default()
        }
    }
}
