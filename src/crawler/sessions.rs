//! Registry of independent polling sessions
//!
//! Each session (typically one per chat user) gets its own transport,
//! fetcher identity and cancellation scope. All sessions share the store and
//! the observer.

use crate::config::Config;
use crate::crawler::coordinator::Orchestrator;
use crate::crawler::fetcher::{Fetcher, ReqwestTransport, Transport};
use crate::notify::ListingObserver;
use crate::storage::SharedStore;
use crate::{SessionId, WatchError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Builds the transport of a new session from its effective config
pub type TransportFactory =
    Arc<dyn Fn(&Config) -> Result<Arc<dyn Transport>, WatchError> + Send + Sync>;

fn reqwest_factory() -> TransportFactory {
    Arc::new(|config: &Config| -> Result<Arc<dyn Transport>, WatchError> {
        let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::from_config(config)?);
        Ok(transport)
    })
}

/// Sessions keyed by session id
pub struct SessionRegistry {
    config: Config,
    store: SharedStore,
    observer: Arc<dyn ListingObserver>,
    transport_factory: TransportFactory,
    sessions: HashMap<SessionId, Orchestrator>,
}

impl SessionRegistry {
    pub fn new(config: Config, store: SharedStore, observer: Arc<dyn ListingObserver>) -> Self {
        Self {
            config,
            store,
            observer,
            transport_factory: reqwest_factory(),
            sessions: HashMap::new(),
        }
    }

    /// Replaces how session transports are built
    pub fn with_transport_factory(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    /// Starts polling for `session_id`
    ///
    /// `search` entries override the configured search parameters for this
    /// session only. A session that ended on its own may be started again.
    pub async fn start(
        &mut self,
        session_id: SessionId,
        search: BTreeMap<String, String>,
    ) -> Result<(), WatchError> {
        if self.is_running(session_id) {
            return Err(WatchError::SessionAlreadyRunning(session_id));
        }

        let mut config = self.config.clone();
        config.search.extend(search);

        let transport = (self.transport_factory)(&config)?;
        let fetcher = Fetcher::from_config(transport, &config);
        let mut orchestrator = Orchestrator::new(
            session_id,
            &config,
            fetcher,
            Arc::clone(&self.store),
            Arc::clone(&self.observer),
        )?;
        orchestrator.start()?;

        if let Some(mut previous) = self.sessions.insert(session_id, orchestrator) {
            if let Err(e) = previous.join().await {
                tracing::debug!(session = session_id, "Previous run had ended with: {}", e);
            }
        }

        tracing::info!(session = session_id, "Session started");
        Ok(())
    }

    /// Stops and removes a session
    ///
    /// Returns the error the session had ended with, if any.
    pub async fn stop(&mut self, session_id: SessionId) -> Result<(), WatchError> {
        let mut orchestrator = self
            .sessions
            .remove(&session_id)
            .ok_or(WatchError::SessionNotFound(session_id))?;

        let result = orchestrator.stop().await;
        tracing::info!(session = session_id, "Session stopped");
        result
    }

    pub fn is_running(&self, session_id: SessionId) -> bool {
        self.sessions
            .get(&session_id)
            .is_some_and(Orchestrator::is_running)
    }

    /// Ids of sessions whose loop is active, ascending
    pub fn running_sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, orchestrator)| orchestrator.is_running())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Stops every session and returns the errors they had ended with
    pub async fn stop_all(&mut self) -> Vec<(SessionId, WatchError)> {
        let mut failures = Vec::new();

        for (session_id, mut orchestrator) in self.sessions.drain() {
            if let Err(e) = orchestrator.stop().await {
                tracing::warn!(session = session_id, "Session had failed: {}", e);
                failures.push((session_id, e));
            }
        }

        failures
    }
}
