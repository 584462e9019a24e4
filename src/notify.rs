//! Notification hook invoked by the orchestrator
//!
//! Delivery (chat messages, rate limiting, formatting) belongs to the
//! embedding application. The crate ships a logging observer for the CLI and
//! a channel observer for applications that consume events from a task.

use crate::listing::Listing;
use crate::{SessionId, WatchError};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Receives the results of a session's polling iterations
#[async_trait]
pub trait ListingObserver: Send + Sync {
    /// Called after an iteration committed new listings, newest first
    async fn on_new_listings(&self, session_id: SessionId, listings: &[Listing]);

    /// Called once when a session stops because of an error
    async fn on_session_error(&self, _session_id: SessionId, _error: &WatchError) {}
}

/// Writes every event to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

#[async_trait]
impl ListingObserver for LogObserver {
    async fn on_new_listings(&self, session_id: SessionId, listings: &[Listing]) {
        tracing::info!(session = session_id, "{} new listing(s)", listings.len());
        for listing in listings {
            tracing::info!(session = session_id, "  {}", listing);
        }
    }

    async fn on_session_error(&self, session_id: SessionId, error: &WatchError) {
        tracing::error!(session = session_id, "Session stopped: {}", error);
    }
}

/// An event forwarded by `ChannelObserver`
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    NewListings {
        session_id: SessionId,
        listings: Vec<Listing>,
    },
    Stopped {
        session_id: SessionId,
        error: String,
    },
}

/// Forwards events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    /// Creates the observer and the receiving end of its channel
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SessionEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("Event receiver dropped, discarding event");
        }
    }
}

#[async_trait]
impl ListingObserver for ChannelObserver {
    async fn on_new_listings(&self, session_id: SessionId, listings: &[Listing]) {
        self.send(SessionEvent::NewListings {
            session_id,
            listings: listings.to_vec(),
        });
    }

    async fn on_session_error(&self, session_id: SessionId, error: &WatchError) {
        self.send(SessionEvent::Stopped {
            session_id,
            error: error.to_string(),
        });
    }
}
