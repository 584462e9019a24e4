//! Polling session orchestration
//!
//! An `Orchestrator` owns one session's loop:
//!
//! 1. Fetch the search-results page
//! 2. Parse the listing links
//! 3. Run the dedup-and-save pipeline over them
//! 4. Notify the observer about committed listings
//! 5. Sleep a jittered interval, then repeat
//!
//! The loop runs as a tokio task and stops cooperatively: cancellation is
//! observed while fetching the index page, while sleeping and before every
//! detail request attempt, but a batch that is already committing always
//! completes.

use crate::config::{Config, ScraperConfig};
use crate::crawler::detail::parse_detail;
use crate::crawler::fetcher::{Fetcher, ReqwestTransport};
use crate::crawler::parser::parse_index;
use crate::crawler::pipeline::ListingPipeline;
use crate::listing::Listing;
use crate::notify::ListingObserver;
use crate::state::SessionState;
use crate::storage::SharedStore;
use crate::{SessionId, WatchError};
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use url::Url;

fn lock_state(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resets the session to Idle when the loop task ends, including by panic
struct IdleOnDrop(Arc<Mutex<SessionState>>);

impl Drop for IdleOnDrop {
    fn drop(&mut self) {
        *lock_state(&self.0) = SessionState::Idle;
    }
}

/// Uniform pause in `[low, high)`, or `low` when the range is empty
fn jitter(low: Duration, high: Duration) -> Duration {
    if high <= low {
        low
    } else {
        rand::thread_rng().gen_range(low..high)
    }
}

/// Fetches and parses one detail page
///
/// Returns `Ok(None)` when the fetch gave up, was cancelled or the page
/// held no listing data.
pub async fn fetch_listing(
    fetcher: &Fetcher,
    url: &str,
    max_retries: u32,
    delay: Duration,
    cancel: &CancellationToken,
) -> Result<Option<Listing>, WatchError> {
    let target = Url::parse(url)?;
    let response = fetcher
        .fetch_cancellable(&target, None, max_retries, delay, cancel)
        .await;
    if !response.is_success() {
        tracing::debug!(url = %url, status = response.status, "Detail page unavailable");
        return Ok(None);
    }

    let mut listing = parse_detail(&response.body);
    listing.url = url.to_string();

    if listing.is_empty() {
        tracing::debug!(url = %url, "Detail page held no listing data");
        return Ok(None);
    }

    Ok(Some(listing))
}

/// Everything one iteration needs, shared with the loop task
struct Session {
    id: SessionId,
    scraper: ScraperConfig,
    base_url: Url,
    index_url: Url,
    search: BTreeMap<String, String>,
    fetcher: Arc<Fetcher>,
    store: SharedStore,
    observer: Arc<dyn ListingObserver>,
}

impl Session {
    /// One loop body without the trailing sleep
    async fn iterate(&self, cancel: &CancellationToken) -> Result<usize, WatchError> {
        let scraper = &self.scraper;
        let delay = scraper.inter_request_delay();

        let index = tokio::select! {
            _ = cancel.cancelled() => return Ok(0),
            index = self.fetcher.fetch(&self.index_url, Some(&self.search), scraper.max_retries, delay) => index,
        };

        if !index.is_success() {
            return Err(WatchError::IndexUnavailable {
                url: self.index_url.to_string(),
            });
        }

        let pause = jitter(Duration::ZERO, delay);
        if !pause.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(0),
                _ = tokio::time::sleep(pause) => {}
            }
        }

        let page = parse_index(&index.body, &self.base_url);
        tracing::info!(
            session = self.id,
            listings = page.urls.len(),
            skipped = page.skipped,
            "Index page parsed"
        );

        let fetcher = Arc::clone(&self.fetcher);
        let retries = scraper.detail_max_retries;
        let detail_cancel = cancel.clone();
        let pipeline =
            ListingPipeline::new(Arc::clone(&self.store)).with_cancellation(cancel.clone());

        let staged = pipeline
            .run(
                &page.urls,
                move |url| {
                    let fetcher = Arc::clone(&fetcher);
                    let cancel = detail_cancel.clone();
                    async move { fetch_listing(&fetcher, &url, retries, delay, &cancel).await }
                },
                scraper.concurrency_limit,
            )
            .await?;

        if !staged.is_empty() {
            self.observer.on_new_listings(self.id, &staged).await;
        }

        Ok(staged.len())
    }

    /// Reports the terminal error once and hands it back
    async fn fail(&self, error: WatchError) -> Result<(), WatchError> {
        tracing::error!(session = self.id, "Polling stopped: {}", error);
        self.observer.on_session_error(self.id, &error).await;
        Err(error)
    }
}

async fn run_loop(session: Arc<Session>, cancel: CancellationToken) -> Result<(), WatchError> {
    let failure_limit = session.scraper.max_consecutive_failures.max(1);
    let (poll_min, poll_max) = session.scraper.poll_interval();
    let mut failures = 0u32;

    tracing::info!(session = session.id, "Polling started");

    while !cancel.is_cancelled() {
        match session.iterate(&cancel).await {
            Ok(staged) => {
                failures = 0;
                tracing::info!(session = session.id, staged, "Iteration finished");
            }
            Err(e) if e.is_fatal() => return session.fail(e).await,
            Err(e) => {
                failures += 1;
                tracing::warn!(session = session.id, failures, "Iteration failed: {}", e);

                if failures >= failure_limit {
                    let error = WatchError::TooManyFailures {
                        failures,
                        last: e.to_string(),
                    };
                    return session.fail(error).await;
                }
            }
        }

        let pause = jitter(poll_min, poll_max);
        tracing::debug!(session = session.id, "Sleeping {:.1}s", pause.as_secs_f64());

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }

    tracing::info!(session = session.id, "Polling stopped");
    Ok(())
}

/// Owner of one polling session
///
/// Dropping the orchestrator cancels its loop.
pub struct Orchestrator {
    session: Arc<Session>,
    state: Arc<Mutex<SessionState>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<Result<(), WatchError>>>,
}

impl Orchestrator {
    /// Creates an idle orchestrator
    ///
    /// # Arguments
    ///
    /// * `session_id` - Identifier passed to the observer
    /// * `config` - Scraper settings and search parameters of this session
    /// * `fetcher` - The session's own fetcher (and transport)
    /// * `store` - Store shared with other sessions
    /// * `observer` - Notification hook
    ///
    /// # Returns
    ///
    /// * `Err(WatchError::UrlParse)` - The base or index URL is invalid
    pub fn new(
        session_id: SessionId,
        config: &Config,
        fetcher: Fetcher,
        store: SharedStore,
        observer: Arc<dyn ListingObserver>,
    ) -> Result<Self, WatchError> {
        let session = Session {
            id: session_id,
            scraper: config.scraper.clone(),
            base_url: Url::parse(&config.scraper.base_url)?,
            index_url: config.scraper.index_url()?,
            search: config.search.clone(),
            fetcher: Arc::new(fetcher),
            store,
            observer,
        };

        Ok(Self {
            session: Arc::new(session),
            state: Arc::new(Mutex::new(SessionState::Idle)),
            cancel: CancellationToken::new(),
            handle: None,
        })
    }

    /// Creates an orchestrator with its own `reqwest` transport
    pub fn from_config(
        session_id: SessionId,
        config: &Config,
        store: SharedStore,
        observer: Arc<dyn ListingObserver>,
    ) -> Result<Self, WatchError> {
        let transport = Arc::new(ReqwestTransport::from_config(config)?);
        let fetcher = Fetcher::from_config(transport, config);
        Self::new(session_id, config, fetcher, store, observer)
    }

    pub fn session_id(&self) -> SessionId {
        self.session.id
    }

    pub fn state(&self) -> SessionState {
        *lock_state(&self.state)
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// Moves Idle -> Running and spawns the polling loop
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<(), WatchError> {
        {
            let mut state = lock_state(&self.state);
            if !state.can_transition_to(SessionState::Running) {
                return Err(WatchError::InvalidTransition {
                    from: *state,
                    to: SessionState::Running,
                });
            }
            *state = SessionState::Running;
        }

        if self.handle.take().is_some() {
            tracing::debug!(session = self.session.id, "Discarding finished loop handle");
        }

        self.cancel = CancellationToken::new();
        let session = Arc::clone(&self.session);
        let cancel = self.cancel.clone();
        let idle = IdleOnDrop(Arc::clone(&self.state));

        self.handle = Some(tokio::spawn(async move {
            let _idle = idle;
            run_loop(session, cancel).await
        }));

        Ok(())
    }

    /// Runs exactly one iteration in the caller's task, without sleeping
    ///
    /// Returns the number of listings committed.
    pub async fn run_once(&self) -> Result<usize, WatchError> {
        if self.is_running() {
            return Err(WatchError::InvalidTransition {
                from: SessionState::Running,
                to: SessionState::Running,
            });
        }

        self.session.iterate(&CancellationToken::new()).await
    }

    /// Cancels the loop and waits for it to finish
    ///
    /// Returns the error the loop ended with, if it ended on its own because
    /// of one.
    pub async fn stop(&mut self) -> Result<(), WatchError> {
        self.cancel.cancel();
        self.join().await
    }

    /// Waits for the loop to end without cancelling it
    ///
    /// Cancel safe: dropping the returned future keeps the loop handle.
    pub async fn join(&mut self) -> Result<(), WatchError> {
        let result = match self.handle.as_mut() {
            None => Ok(()),
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(WatchError::Worker(format!(
                    "session {} loop aborted: {}",
                    self.session.id, e
                ))),
            },
        };

        self.handle = None;
        *lock_state(&self.state) = SessionState::Idle;
        result
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
