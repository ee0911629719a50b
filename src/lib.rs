//! # SMS Store
//!
//! SQLite-backed storage for SMS/MMS conversations.
//!
//! A [`Store`] serializes every database access onto one worker thread and
//! reports committed changes back to the thread that owns it. On top of it
//! sit two live views: the [`Summary`] (newest message of every thread) and
//! [`MessageThread`] (one conversation, oldest first, hydrated lazily).

pub mod config;
pub mod db;
mod dispatch;
pub mod events;
pub mod message;
pub mod queue;
pub mod summary;
pub mod thread;

pub use config::{Location, StoreConfig};
pub use db::{Store, StoreError, StoreResult};
pub use events::{HandlerId, StoreEvent};
pub use message::{Message, MessageBox, ThreadItem};
pub use summary::Summary;
pub use thread::MessageThread;
pub use tokio_util::sync::CancellationToken;

/// Load `.env` and initialize logging with an `info` default filter.
///
/// Safe to call more than once; later calls leave the first logger in place.
pub fn init_logging() {
    dotenvy::dotenv().ok();

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}
