//! Storage traits and error types
//!
//! This module defines the narrow store contract used by the listing
//! pipeline and the orchestrator, and the associated error types.

use crate::listing::Listing;
use std::collections::HashSet;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns true if the error is a uniqueness/foreign-key rejection
    pub fn is_constraint_violation(&self) -> bool {
        matches!(self, Self::ConstraintViolation(_))
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Store contract for listings
///
/// The URL uniqueness constraint of the backing store is the authoritative
/// guard against duplicates; `known_urls` is only used to avoid needless
/// detail fetches.
pub trait ListingStore {
    /// Returns every listing URL already stored
    fn known_urls(&self) -> StorageResult<HashSet<String>>;

    /// Checks whether a single URL is already stored
    fn exists_url(&self, url: &str) -> StorageResult<bool>;

    /// Returns the most recently stored listings, newest first
    fn recent(&self, limit: usize) -> StorageResult<Vec<Listing>>;

    /// Counts stored listings
    fn count(&self) -> StorageResult<u64>;

    /// Opens a write transaction
    ///
    /// Nothing staged through the transaction is visible to other readers
    /// until `commit`. Dropping the transaction without committing rolls it
    /// back.
    fn begin(&mut self) -> StorageResult<Box<dyn StoreTransaction + '_>>;
}

/// A write transaction over a `ListingStore`
pub trait StoreTransaction {
    /// Inserts the listing row and returns its identity
    fn insert(&mut self, listing: &Listing) -> StorageResult<i64>;

    /// Inserts the image rows of a previously inserted listing
    fn insert_images(&mut self, listing_id: i64, urls: &[String]) -> StorageResult<()>;

    /// Stages a listing together with its images
    ///
    /// Implementations should make this all-or-nothing per listing so a
    /// failed record leaves no partial rows behind in the transaction.
    fn stage(&mut self, listing: &Listing) -> StorageResult<i64> {
        let id = self.insert(listing)?;
        self.insert_images(id, &listing.images)?;
        Ok(id)
    }

    /// Commits everything staged so far
    fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Discards everything staged so far
    fn rollback(self: Box<Self>) -> StorageResult<()>;
}
