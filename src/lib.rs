//! Estate-Watch: a polling real-estate listing watcher
//!
//! This crate discovers listings on a search-results page, fetches the
//! detail page of every listing it has not seen before, persists the new
//! ones in a single transaction and hands them to a notification hook.

pub mod config;
pub mod crawler;
pub mod listing;
pub mod notify;
pub mod state;
pub mod storage;

use thiserror::Error;

/// Identifier of one polling session (typically the chat or user id)
pub type SessionId = i64;

/// Main error type for Estate-Watch operations
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("HTTP client error: {0}")]
    Reqwest(#[from] reqwest::Error),

    #[error("Index page unavailable after retries: {url}")]
    IndexUnavailable { url: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] storage::StorageError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] ::url::ParseError),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: state::SessionState,
        to: state::SessionState,
    },

    #[error("Session {0} is not registered")]
    SessionNotFound(SessionId),

    #[error("Session {0} is already running")]
    SessionAlreadyRunning(SessionId),

    #[error("Session stopped after {failures} consecutive failed iterations: {last}")]
    TooManyFailures { failures: u32, last: String },

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WatchError {
    /// Returns true if the error must terminate the session instead of only
    /// ending the current iteration
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::UrlParse(_)
                | Self::InvalidTransition { .. }
                | Self::TooManyFailures { .. }
                | Self::Worker(_)
        )
    }
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid URL in config: {0}")]
    InvalidUrl(String),
}

/// Result type alias for Estate-Watch operations
pub type Result<T> = std::result::Result<T, WatchError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

// Re-export commonly used types
pub use config::Config;
pub use listing::Listing;
pub use state::SessionState;
