//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the store contract.

use crate::listing::Listing;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{ListingStore, StorageError, StorageResult, StoreTransaction};
use crate::WatchError;
use chrono::Utc;
use rusqlite::{params, Connection, ErrorCode, Row, Transaction};
use std::collections::HashSet;
use std::path::Path;

const LISTING_COLUMNS: &str = "id, url, title, price, currency, description, address,
     date_published, rooms, area, living_area, kitchen_area, floor, build_year";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Opens or creates the database at `path` and initializes the schema
    pub fn new(path: &Path) -> Result<Self, WatchError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn open_in_memory() -> Result<Self, WatchError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }

    fn load_images(&self, listing_id: i64) -> StorageResult<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT url FROM listing_images WHERE listing_id = ?1 ORDER BY position ASC",
        )?;

        let images = stmt
            .query_map(params![listing_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;

        Ok(images)
    }
}

/// Maps a row selected with `LISTING_COLUMNS` to its id and listing
fn listing_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Listing)> {
    let listing = Listing {
        url: row.get(1)?,
        title: row.get(2)?,
        price: row.get(3)?,
        currency: row.get(4)?,
        description: row.get(5)?,
        address: row.get(6)?,
        date_published: row.get(7)?,
        rooms: row.get(8)?,
        area: row.get(9)?,
        living_area: row.get(10)?,
        kitchen_area: row.get(11)?,
        floor: row.get(12)?,
        build_year: row.get(13)?,
        images: Vec::new(),
    };
    Ok((row.get(0)?, listing))
}

/// Turns SQLite constraint failures into `StorageError::ConstraintViolation`
fn classify(err: rusqlite::Error, url: &str) -> StorageError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation => {
            StorageError::ConstraintViolation(format!("{}: {}", url, err))
        }
        _ => StorageError::Sqlite(err),
    }
}

fn insert_listing(conn: &Connection, listing: &Listing) -> StorageResult<i64> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO listings (url, title, price, currency, description, address,
         date_published, rooms, area, living_area, kitchen_area, floor, build_year, scraped_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            listing.url,
            listing.title,
            listing.price,
            listing.currency,
            listing.description,
            listing.address,
            listing.date_published,
            listing.rooms,
            listing.area,
            listing.living_area,
            listing.kitchen_area,
            listing.floor,
            listing.build_year,
            now,
        ],
    )
    .map_err(|e| classify(e, &listing.url))?;

    Ok(conn.last_insert_rowid())
}

fn insert_image_rows(conn: &Connection, listing_id: i64, urls: &[String]) -> StorageResult<()> {
    let mut stmt = conn
        .prepare("INSERT INTO listing_images (listing_id, url, position) VALUES (?1, ?2, ?3)")?;

    for (position, url) in urls.iter().enumerate() {
        stmt.execute(params![listing_id, url, position as i64])
            .map_err(|e| classify(e, url))?;
    }

    Ok(())
}

impl ListingStore for SqliteStorage {
    fn known_urls(&self) -> StorageResult<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT url FROM listings")?;

        let urls = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;

        Ok(urls)
    }

    fn exists_url(&self, url: &str) -> StorageResult<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM listings WHERE url = ?1)",
            params![url],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn recent(&self, limit: usize) -> StorageResult<Vec<Listing>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM listings ORDER BY id DESC LIMIT ?1",
            LISTING_COLUMNS
        ))?;

        let rows = stmt
            .query_map(params![limit as i64], listing_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        let mut listings = Vec::with_capacity(rows.len());
        for (id, mut listing) in rows {
            listing.images = self.load_images(id)?;
            listings.push(listing);
        }

        Ok(listings)
    }

    fn count(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM listings", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn begin(&mut self) -> StorageResult<Box<dyn StoreTransaction + '_>> {
        let tx = self.conn.transaction()?;
        Ok(Box::new(SqliteTransaction { tx }))
    }
}

/// An open SQLite write transaction
pub struct SqliteTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl StoreTransaction for SqliteTransaction<'_> {
    fn insert(&mut self, listing: &Listing) -> StorageResult<i64> {
        insert_listing(&self.tx, listing)
    }

    fn insert_images(&mut self, listing_id: i64, urls: &[String]) -> StorageResult<()> {
        insert_image_rows(&self.tx, listing_id, urls)
    }

    /// Stages the listing inside a savepoint; a failure rolls back only this
    /// listing's rows
    fn stage(&mut self, listing: &Listing) -> StorageResult<i64> {
        let sp = self.tx.savepoint()?;
        let id = insert_listing(&sp, listing)?;
        insert_image_rows(&sp, id, &listing.images)?;
        sp.commit()?;
        Ok(id)
    }

    fn commit(self: Box<Self>) -> StorageResult<()> {
        self.tx.commit()?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> StorageResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}
