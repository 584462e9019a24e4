//! HTTP fetcher implementation
//!
//! This module handles all HTTP requests for the scraper, including:
//! - Building pooled HTTP clients (one direct, one per proxy)
//! - Browser-like request headers with a rotating user agent
//! - Retry logic with identity rotation between attempts
//! - Exponential backoff with jitter on HTTP 429
//! - Error classification
//!
//! Exhausted retries are not an error: `fetch` returns the
//! `FetchResult::failed()` sentinel and the caller decides what to do.

use crate::config::Config;
use crate::crawler::proxy::{Identity, ProxyManager};
use crate::WatchError;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{redirect::Policy, Client, Proxy};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Longest single 429 backoff
const MAX_BACKOFF: Duration = Duration::from_secs(600);

/// Result of a fetch operation
///
/// Header names are lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchResult {
    pub body: String,
    pub status: u16,
    pub headers: HashMap<String, String>,
}

impl FetchResult {
    /// Status of the "retries exhausted" sentinel
    pub const FAILED_STATUS: u16 = 500;

    /// The sentinel returned once every attempt has failed
    pub fn failed() -> Self {
        Self {
            body: String::new(),
            status: Self::FAILED_STATUS,
            headers: HashMap::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Returns true for the exhausted-retries sentinel
    pub fn is_failed(&self) -> bool {
        self.status == Self::FAILED_STATUS && self.body.is_empty() && self.headers.is_empty()
    }
}

/// Network-level failure of a single attempt
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timeout")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("unknown proxy: {0}")]
    UnknownProxy(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// Issues a single GET request with the given identity
///
/// Any HTTP status is a successful transport result; only network failures
/// are errors.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url, identity: &Identity) -> Result<FetchResult, TransportError>;
}

/// `reqwest` based transport
///
/// Clients are built once: one for direct egress and one per configured
/// proxy, so connection pools are reused across requests of a session.
pub struct ReqwestTransport {
    direct: Client,
    proxied: HashMap<String, Client>,
    referer: String,
}

impl ReqwestTransport {
    /// Builds the transport
    ///
    /// # Arguments
    ///
    /// * `proxies` - Proxy addresses that identities may point at
    /// * `timeout` - Total timeout of one request
    /// * `referer` - Value of the Referer header
    ///
    /// # Returns
    ///
    /// * `Ok(ReqwestTransport)` - All clients were built
    /// * `Err(reqwest::Error)` - A client or proxy address was rejected
    pub fn new(proxies: &[String], timeout: Duration, referer: &str) -> Result<Self, reqwest::Error> {
        let direct = build_http_client(None, timeout)?;

        let mut proxied = HashMap::with_capacity(proxies.len());
        for address in proxies {
            proxied.insert(address.clone(), build_http_client(Some(address), timeout)?);
        }

        Ok(Self {
            direct,
            proxied,
            referer: referer.to_string(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, WatchError> {
        Ok(Self::new(
            &config.proxy.addresses,
            config.scraper.request_timeout(),
            &config.scraper.base_url,
        )?)
    }

    fn client_for(&self, identity: &Identity) -> Result<&Client, TransportError> {
        match &identity.proxy {
            None => Ok(&self.direct),
            Some(address) => self
                .proxied
                .get(address)
                .ok_or_else(|| TransportError::UnknownProxy(identity.egress())),
        }
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url, identity: &Identity) -> Result<FetchResult, TransportError> {
        let response = self
            .client_for(identity)?
            .get(url.clone())
            .header(header::USER_AGENT, identity.user_agent)
            .header(header::REFERER, self.referer.as_str())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response.text().await?;

        Ok(FetchResult {
            body,
            status,
            headers,
        })
    }
}

/// Builds an HTTP client with browser-like default headers
///
/// The user agent and Referer are set per request.
pub fn build_http_client(proxy: Option<&str>, timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers.insert(header::ACCEPT_LANGUAGE, HeaderValue::from_static(ACCEPT_LANGUAGE));
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));

    let mut builder = Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(10)))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true);

    if let Some(address) = proxy {
        builder = builder.proxy(Proxy::all(address)?);
    }

    builder.build()
}

/// Wait before the attempt following a 429 on attempt `attempt` (0-based)
///
/// Uniform in `[base * factor^attempt, base * factor^(attempt + 1))`.
pub fn backoff_delay<R: Rng + ?Sized>(
    base: Duration,
    factor: f64,
    attempt: u32,
    rng: &mut R,
) -> Duration {
    let cap = MAX_BACKOFF.as_secs_f64();
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let low = base.as_secs_f64() * factor.powi(exponent);

    if !low.is_finite() || low >= cap {
        return MAX_BACKOFF;
    }

    let high = (low * factor).min(cap);
    let secs = if high > low {
        rng.gen_range(low..high)
    } else {
        low
    };

    Duration::from_secs_f64(secs.max(0.0))
}

/// Retrying fetcher with rotating egress identity
///
/// The identity of the last attempt is kept between calls, so consecutive
/// fetches on the same instance keep rotating from where the previous one
/// stopped.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    proxies: ProxyManager,
    identity: Mutex<Identity>,
    backoff_base: Duration,
    backoff_factor: f64,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, proxies: ProxyManager) -> Self {
        let identity = proxies.next();
        Self {
            transport,
            proxies,
            identity: Mutex::new(identity),
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2.0,
        }
    }

    /// Overrides the 429 backoff parameters
    pub fn with_backoff(mut self, base: Duration, factor: f64) -> Self {
        self.backoff_base = base;
        self.backoff_factor = factor;
        self
    }

    pub fn from_config(transport: Arc<dyn Transport>, config: &Config) -> Self {
        Self::new(transport, ProxyManager::from_config(&config.proxy))
            .with_backoff(config.scraper.backoff_base(), config.scraper.backoff_factor)
    }

    /// Identity of the most recent attempt
    pub fn identity(&self) -> Identity {
        match self.identity.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn set_identity(&self, identity: &Identity) {
        match self.identity.lock() {
            Ok(mut guard) => *guard = identity.clone(),
            Err(poisoned) => *poisoned.into_inner() = identity.clone(),
        }
    }

    /// Fetches `target` with up to `max_retries` attempts
    ///
    /// # Retry Logic
    ///
    /// | Condition | Action |
    /// |-----------|--------|
    /// | HTTP 200 | Return the response |
    /// | HTTP 403 | Rotate proxy and user agent, retry |
    /// | HTTP 429 | Jittered exponential backoff, retry |
    /// | Other status | Rotate proxy, retry |
    /// | Timeout / connection / TLS error | Rotate proxy, retry |
    ///
    /// Every attempt sleeps `delay` first and uses a user agent different
    /// from the previous attempt's.
    ///
    /// # Returns
    ///
    /// The first HTTP 200 response, or `FetchResult::failed()` once all
    /// attempts are spent.
    pub async fn fetch(
        &self,
        target: &Url,
        query: Option<&BTreeMap<String, String>>,
        max_retries: u32,
        delay: Duration,
    ) -> FetchResult {
        self.fetch_cancellable(target, query, max_retries, delay, &CancellationToken::new())
            .await
    }

    /// Same as [`Fetcher::fetch`], but gives up once `cancel` fires
    ///
    /// Cancellation is checked before every attempt and interrupts the
    /// per-attempt delay and 429 backoff. A request already on the wire is
    /// allowed to finish. A cancelled fetch returns `FetchResult::failed()`.
    pub async fn fetch_cancellable(
        &self,
        target: &Url,
        query: Option<&BTreeMap<String, String>>,
        max_retries: u32,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> FetchResult {
        let url = with_query(target, query);
        let mut rng = StdRng::from_entropy();
        let mut identity = self.identity();
        let mut rotate_proxy = false;

        for attempt in 0..max_retries {
            if !pause(delay, cancel).await {
                tracing::debug!(url = %url, attempt, "Fetch cancelled");
                return FetchResult::failed();
            }

            identity = self.proxies.rotate(&identity, rotate_proxy, &mut rng);
            self.set_identity(&identity);

            match self.transport.get(&url, &identity).await {
                Ok(response) if response.status == 200 => {
                    tracing::debug!(url = %url, attempt, egress = %identity.egress(), "Fetched");
                    return response;
                }
                Ok(response) if response.status == 403 => {
                    tracing::warn!(
                        url = %url,
                        attempt,
                        egress = %identity.egress(),
                        "Blocked with HTTP 403, rotating identity"
                    );
                    rotate_proxy = true;
                }
                Ok(response) if response.status == 429 => {
                    rotate_proxy = false;
                    if attempt + 1 < max_retries {
                        let wait =
                            backoff_delay(self.backoff_base, self.backoff_factor, attempt, &mut rng);
                        tracing::warn!(
                            url = %url,
                            attempt,
                            "Rate limited with HTTP 429, backing off {:.1}s",
                            wait.as_secs_f64()
                        );
                        if !pause(wait, cancel).await {
                            tracing::debug!(url = %url, attempt, "Fetch cancelled during backoff");
                            return FetchResult::failed();
                        }
                    }
                }
                Ok(response) => {
                    tracing::warn!(
                        url = %url,
                        attempt,
                        status = response.status,
                        "Unexpected status, rotating proxy"
                    );
                    rotate_proxy = true;
                }
                Err(e) => {
                    tracing::warn!(
                        url = %url,
                        attempt,
                        egress = %identity.egress(),
                        "Request failed: {}",
                        e
                    );
                    rotate_proxy = true;
                }
            }
        }

        tracing::error!(url = %url, max_retries, "Giving up after {} attempts", max_retries);
        FetchResult::failed()
    }
}

/// Sleeps for `duration` unless `cancel` fires first
///
/// Returns false when cancelled.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    if duration.is_zero() {
        return true;
    }

    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

/// Appends `query` to `target` as URL-encoded pairs
fn with_query(target: &Url, query: Option<&BTreeMap<String, String>>) -> Url {
    let mut url = target.clone();
    if let Some(params) = query.filter(|p| !p.is_empty()) {
        url.query_pairs_mut().extend_pairs(params.iter());
    }
    url
}
