//! Store configuration
//!
//! Resolves where a context's database lives. Each device context gets its
//! own `sms.db` under the cache directory:
//!
//! ```text
//! <cache root>/<domain>/<id>/sms/sms.db
//! ```
//!
//! The cache root is `$SMS_STORE_CACHE_DIR` when set (a `.env` file is
//! honoured via `init_logging`), otherwise the platform cache directory.

use crate::db::{StoreError, StoreResult};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the cache root
pub const CACHE_DIR_ENV: &str = "SMS_STORE_CACHE_DIR";

/// Database file name within a context directory
pub const DATABASE_FILE: &str = "sms.db";

const DEFAULT_THREAD_NAME: &str = "sms-store";

/// Where the database lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub location: Location,
    /// Name given to the worker thread
    pub thread_name: String,
}

impl StoreConfig {
    /// Database of a device context under the resolved cache root
    pub fn for_context(domain: &str, id: &str) -> StoreResult<Self> {
        let root = cache_root().ok_or_else(|| {
            StoreError::Config("could not determine a cache directory".to_string())
        })?;
        Ok(Self::for_context_in(root, domain, id))
    }

    /// Database of a device context under an explicit cache root
    pub fn for_context_in(root: impl AsRef<Path>, domain: &str, id: &str) -> Self {
        let path = root
            .as_ref()
            .join(domain)
            .join(id)
            .join("sms")
            .join(DATABASE_FILE);
        Self::with_path(path)
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            location: Location::File(path.into()),
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    /// Private in-memory database, mostly useful for tests
    pub fn in_memory() -> Self {
        Self {
            location: Location::Memory,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.location {
            Location::File(path) => Some(path),
            Location::Memory => None,
        }
    }
}

fn cache_root() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return Some(PathBuf::from(dir));
    }

    ProjectDirs::from("org", "sms-store", "sms-store").map(|dirs| dirs.cache_dir().to_path_buf())
}
