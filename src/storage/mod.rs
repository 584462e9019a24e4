//! Storage module for persisting listings
//!
//! This module handles all database operations, including:
//! - SQLite database initialization and schema management
//! - The narrow store contract used by the pipeline (known URLs, staged
//!   inserts, one commit per batch)
//! - Recent-N and count reads used for notifications and statistics

mod schema;
mod sqlite;
mod traits;

pub use sqlite::{SqliteStorage, SqliteTransaction};
pub use traits::{ListingStore, StorageError, StorageResult, StoreTransaction};

use crate::WatchError;

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// A store shared by the sessions of one process
///
/// The lock is never held across an `.await`.
pub type SharedStore = Arc<Mutex<dyn ListingStore + Send>>;

/// Opens (or creates) the SQLite database at `path` as a shared store
pub fn open_storage(path: &Path) -> Result<SharedStore, WatchError> {
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Locks a shared store, mapping poisoning to a storage error
pub fn lock_store(store: &SharedStore) -> StorageResult<MutexGuard<'_, dyn ListingStore + Send + 'static>> {
    store.lock().map_err(|_| StorageError::LockPoisoned)
}
