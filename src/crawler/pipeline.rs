//! Dedup and bounded-concurrency save pipeline
//!
//! One run takes the candidate URLs of an index page, drops the ones the
//! store already knows, fetches the remaining detail pages through a worker
//! pool and commits every produced listing in a single transaction.

use crate::listing::Listing;
use crate::storage::{lock_store, SharedStore};
use crate::WatchError;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Concurrent detail fetches when none is configured
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Dedup-and-persist engine over a shared store
pub struct ListingPipeline {
    store: SharedStore,
    cancel: CancellationToken,
}

impl ListingPipeline {
    pub fn new(store: SharedStore) -> Self {
        Self {
            store,
            cancel: CancellationToken::new(),
        }
    }

    /// Workers observing `cancel` before their fetch skip it
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Runs one batch and returns the listings it committed
    ///
    /// # Algorithm
    ///
    /// 1. Snapshot the store's known URLs once
    /// 2. Drop known URLs and repeats within `urls`
    /// 3. Call `detail_fetch` for each remaining URL, at most
    ///    `concurrency_limit` at a time
    /// 4. Stage every produced listing with its images and commit once
    ///
    /// A failing or panicking `detail_fetch` only loses its own URL. A
    /// listing rejected by the store's uniqueness constraint is skipped and
    /// is not part of the result.
    ///
    /// # Errors
    ///
    /// Batch-level storage failures (snapshot, begin, commit) are returned;
    /// nothing from the batch is persisted in that case.
    pub async fn run<F, Fut>(
        &self,
        urls: &[String],
        detail_fetch: F,
        concurrency_limit: usize,
    ) -> Result<Vec<Listing>, WatchError>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Listing>, WatchError>> + Send + 'static,
    {
        let known = {
            let store = lock_store(&self.store)?;
            store.known_urls()?
        };

        let pending = filter_new(urls, &known);
        tracing::info!(
            candidates = urls.len(),
            new = pending.len(),
            "Filtered candidate listings"
        );

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let records = self.collect(pending, detail_fetch, concurrency_limit).await;
        self.commit(records)
    }

    async fn collect<F, Fut>(
        &self,
        pending: Vec<String>,
        detail_fetch: F,
        concurrency_limit: usize,
    ) -> Vec<Listing>
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Listing>, WatchError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(concurrency_limit.max(1)));
        let detail_fetch = Arc::new(detail_fetch);
        let mut workers = JoinSet::new();

        for url in pending {
            let semaphore = Arc::clone(&semaphore);
            let detail_fetch = Arc::clone(&detail_fetch);
            let cancel = self.cancel.clone();

            workers.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (url, Err(WatchError::Worker(e.to_string()))),
                };

                if cancel.is_cancelled() {
                    tracing::debug!(url = %url, "Cancelled before detail fetch");
                    return (url, Ok(None));
                }

                let result = detail_fetch(url.clone()).await;
                (url, result)
            });
        }

        let mut records = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((url, Ok(Some(mut listing)))) => {
                    if listing.url.is_empty() {
                        listing.url = url;
                    }
                    records.push(listing);
                }
                Ok((url, Ok(None))) => {
                    tracing::debug!(url = %url, "No listing produced");
                }
                Ok((url, Err(e))) => {
                    tracing::warn!(url = %url, "Detail fetch failed: {}", e);
                }
                Err(e) => {
                    tracing::error!("Detail worker aborted: {}", e);
                }
            }
        }

        records
    }

    /// Stages `records` in one transaction and commits it
    fn commit(&self, records: Vec<Listing>) -> Result<Vec<Listing>, WatchError> {
        if records.is_empty() {
            return Ok(records);
        }

        let mut store = lock_store(&self.store)?;
        let mut tx = store.begin()?;
        let mut staged = Vec::with_capacity(records.len());

        for listing in records {
            match tx.stage(&listing) {
                Ok(_) => staged.push(listing),
                Err(e) if e.is_constraint_violation() => {
                    tracing::debug!(url = %listing.url, "Already stored, skipping");
                }
                Err(e) => {
                    tracing::error!(url = %listing.url, "Failed to stage listing: {}", e);
                }
            }
        }

        tx.commit()?;
        tracing::info!(staged = staged.len(), "Committed listing batch");
        Ok(staged)
    }
}

/// URLs not in `known`, first occurrence only, input order kept
fn filter_new(urls: &[String], known: &HashSet<String>) -> Vec<String> {
    let mut seen = HashSet::with_capacity(urls.len());
    let mut pending = Vec::new();

    for url in urls {
        if known.contains(url) {
            tracing::debug!(url = %url, "Already known");
        } else if seen.insert(url.as_str()) {
            pending.push(url.clone());
        }
    }

    pending
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn store() -> SharedStore {
        Arc::new(Mutex::new(SqliteStorage::open_in_memory().unwrap()))
    }

    fn count(store: &SharedStore) -> u64 {
        lock_store(store).unwrap().count().unwrap()
    }

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn titled(url: &str, title: &str) -> Listing {
        let mut listing = Listing::new(url);
        listing.title = Some(title.to_string());
        listing
    }

    /// Detail fetch answering from a fixed map and counting calls
    fn from_map(
        map: HashMap<String, Listing>,
        calls: Arc<AtomicUsize>,
    ) -> impl Fn(String) -> std::future::Ready<Result<Option<Listing>, WatchError>> + Send + Sync + 'static
    {
        move |url| {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(map.get(&url).cloned()))
        }
    }

    #[tokio::test]
    async fn test_listing1_scenario_is_idempotent() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());

        let mut a = titled("/listing1", "A");
        a.price = Some(100.0);
        let map = HashMap::from([("/listing1".to_string(), a.clone())]);
        let input = urls(&["/listing1", "/listing2"]);

        let calls = Arc::new(AtomicUsize::new(0));
        let staged = pipeline
            .run(&input, from_map(map.clone(), calls.clone()), DEFAULT_CONCURRENCY)
            .await
            .unwrap();
        assert_eq!(staged, vec![a.clone()]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let stored = lock_store(&store).unwrap().recent(10).unwrap();
        assert_eq!(stored, vec![a]);

        let staged = pipeline
            .run(&input, from_map(map, calls.clone()), DEFAULT_CONCURRENCY)
            .await
            .unwrap();
        assert_eq!(staged.len(), 0);
        // /listing2 produced nothing, so it is fetched again
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_known_urls_are_never_staged() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input = urls(&["/a", "/b", "/c"]);

        let first: HashMap<_, _> = input.iter().map(|u| (u.clone(), titled(u, "v1"))).collect();
        pipeline
            .run(&input, from_map(first, Arc::new(AtomicUsize::new(0))), 2)
            .await
            .unwrap();

        let second: HashMap<_, _> = input.iter().map(|u| (u.clone(), titled(u, "v2"))).collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let staged = pipeline
            .run(&input, from_map(second, calls.clone()), 2)
            .await
            .unwrap();

        assert_eq!(staged.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(count(&store), 3);
    }

    #[tokio::test]
    async fn test_n_distinct_urls_stage_n_records() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input: Vec<String> = (0..10).map(|i| format!("/flat/{}", i)).collect();
        let map = input.iter().map(|u| (u.clone(), titled(u, "Flat"))).collect();

        let staged = pipeline
            .run(&input, from_map(map, Arc::new(AtomicUsize::new(0))), 3)
            .await
            .unwrap();

        assert_eq!(staged.len(), 10);
        assert_eq!(count(&store), 10);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let calls = Arc::new(AtomicUsize::new(0));

        let staged = pipeline
            .run(&[], from_map(HashMap::new(), calls.clone()), 3)
            .await
            .unwrap();

        assert_eq!(staged.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failing_and_panicking_urls_do_not_abort_batch() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input = urls(&["/ok1", "/err", "/panic", "/ok2"]);

        let staged = pipeline
            .run(
                &input,
                |url: String| async move {
                    match url.as_str() {
                        "/err" => Err(WatchError::Worker("boom".to_string())),
                        "/panic" => panic!("parser exploded"),
                        _ => Ok(Some(titled(&url, "Fine"))),
                    }
                },
                2,
            )
            .await
            .unwrap();

        assert_eq!(staged.len(), 2);
        let stored = lock_store(&store).unwrap().known_urls().unwrap();
        assert!(stored.contains("/ok1") && stored.contains("/ok2"));
    }

    #[tokio::test]
    async fn test_duplicates_in_input_fetch_once() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input = urls(&["/a", "/a", "/b", "/a"]);
        let map = HashMap::from([
            ("/a".to_string(), titled("/a", "A")),
            ("/b".to_string(), titled("/b", "B")),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));

        let staged = pipeline
            .run(&input, from_map(map, calls.clone()), 3)
            .await
            .unwrap();

        assert_eq!(staged.len(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_same_listing_from_two_urls_is_not_an_error() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input = urls(&["/a?from=card", "/a?from=promo"]);

        let staged = pipeline
            .run(&input, |_url: String| async { Ok(Some(titled("/a", "A"))) }, 2)
            .await
            .unwrap();

        assert_eq!(staged.len(), 1);
        assert_eq!(count(&store), 1);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_limit() {
        let store = store();
        let pipeline = ListingPipeline::new(store.clone());
        let input: Vec<String> = (0..12).map(|i| format!("/flat/{}", i)).collect();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (in_flight_c, peak_c) = (in_flight.clone(), peak.clone());

        let staged = pipeline
            .run(
                &input,
                move |url: String| {
                    let in_flight = in_flight_c.clone();
                    let peak = peak_c.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(Some(titled(&url, "Flat")))
                    }
                },
                3,
            )
            .await
            .unwrap();

        assert_eq!(staged.len(), 12);
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_cancelled_pipeline_skips_fetches() {
        let store = store();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pipeline = ListingPipeline::new(store.clone()).with_cancellation(cancel);
        let calls = Arc::new(AtomicUsize::new(0));
        let map = HashMap::from([("/a".to_string(), titled("/a", "A"))]);

        let staged = pipeline
            .run(&urls(&["/a"]), from_map(map, calls.clone()), 3)
            .await
            .unwrap();

        assert_eq!(staged.len(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_filter_new_keeps_order() {
        let known = HashSet::from(["/b".to_string()]);
        let input = urls(&["/c", "/b", "/a", "/c"]);
        assert_eq!(filter_new(&input, &known), urls(&["/c", "/a"]));
    }
}
