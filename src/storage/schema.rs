//! Database schema definitions
//!
//! This module contains all SQL schema definitions for the Estate-Watch database.

/// SQL schema for the database
pub const SCHEMA_SQL: &str = r#"
-- Scraped listings, one row per detail URL
CREATE TABLE IF NOT EXISTS listings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    url TEXT NOT NULL UNIQUE,
    title TEXT,
    price REAL,
    currency TEXT,
    description TEXT,
    address TEXT,
    date_published TEXT,
    rooms INTEGER,
    area TEXT,
    living_area TEXT,
    kitchen_area TEXT,
    floor TEXT,
    build_year TEXT,
    scraped_at TEXT NOT NULL
);

-- Image URLs of a listing, in page order
CREATE TABLE IF NOT EXISTS listing_images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id INTEGER NOT NULL REFERENCES listings(id) ON DELETE CASCADE,
    url TEXT NOT NULL,
    position INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_listing_images_listing ON listing_images(listing_id);
"#;

/// Initializes the database schema
pub fn initialize_schema(conn: &rusqlite::Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}
