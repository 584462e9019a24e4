//! Integration tests for the scraping engine
//!
//! These tests use wiremock to stand in for the listing site and run
//! full polling iterations end-to-end against an on-disk SQLite database.

use estate_watch::config::{parse_config, Config};
use estate_watch::crawler::{Orchestrator, SessionRegistry};
use estate_watch::notify::{ChannelObserver, LogObserver, SessionEvent};
use estate_watch::storage::{lock_store, open_storage};
use estate_watch::WatchError;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header_exists, headers, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Creates a test configuration pointing at the mock server
fn create_test_config(base_url: &str, db_path: &Path) -> Config {
    parse_config(&format!(
        r#"
        [scraper]
        base-url = "{}"
        search-path = "/cat.php"
        max-retries = 2
        detail-max-retries = 3
        backoff-base-ms = 1
        backoff-factor = 2.0
        concurrency-limit = 2
        poll-interval-min-ms = 3600000
        poll-interval-max-ms = 3600001
        max-consecutive-failures = 2

        [search]
        deal_type = "sale"
        region = "1"

        [output]
        database-path = "{}"
        "#,
        base_url,
        db_path.display()
    ))
    .expect("Failed to parse test config")
}

fn index_page(paths: &[&str]) -> String {
    let cards: String = paths
        .iter()
        .map(|p| {
            format!(
                r#"<article data-name="CardComponent">
                    <a class="_93444fe79c--link--eoxce" href="{}">Квартира</a>
                </article>"#,
                p
            )
        })
        .collect();
    format!("<html><body><div data-name=\"Offers\">{}</div></body></html>", cards)
}

fn detail_page(title: &str, price: u64, images: &[&str]) -> String {
    let images: Vec<String> = images.iter().map(|i| format!("\"{}\"", i)).collect();
    format!(
        r#"<html><head>
        <script type="application/ld+json">
        {{"@context": "https://schema.org", "@type": "Product", "name": "{}",
          "description": "Продаётся квартира",
          "offers": {{"@type": "Offer", "price": {}, "priceCurrency": "RUB"}},
          "image": [{}]}}
        </script></head>
        <body>
        <div data-name="AddressContainer"><a>Москва</a><a>ул. Тверская, 7</a></div>
        <div data-name="OfferSummaryInfoItem"><p>Общая площадь</p><p>54 м²</p></div>
        </body></html>"#,
        title,
        price,
        images.join(",")
    )
}

async fn mount_site(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/cat.php"))
        .and(query_param("deal_type", "sale"))
        .and(query_param("region", "1"))
        .and(headers("accept-language", vec!["en-US", "en;q=0.9"]))
        .and(header_exists("user-agent"))
        .and(header_exists("referer"))
        .respond_with(ResponseTemplate::new(200).set_body_string(index_page(&[
            "/sale/flat/1/",
            "/sale/flat/2/",
            "/sale/flat/3/",
            "/sale/flat/1/",
        ])))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sale/flat/1/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(detail_page(
            "2-комн. квартира, 54 м²",
            12_500_000,
            &["https://img.example.com/1a.jpg", "https://img.example.com/1b.jpg"],
        )))
        .mount(server)
        .await;

    // Rate limited once, then served
    Mock::given(method("GET"))
        .and(path("/sale/flat/2/"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sale/flat/2/"))
        .respond_with(ResponseTemplate::new(200).set_body_string(detail_page(
            "1-комн. квартира, 38 м²",
            8_900_000,
            &[],
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/sale/flat/3/"))
        .respond_with(ResponseTemplate::new(500))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_run_once_end_to_end() {
    let mock_server = MockServer::start().await;
    mount_site(&mock_server).await;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("listings.db");
    let config = create_test_config(&mock_server.uri(), &db_path);

    let store = open_storage(&db_path).expect("Failed to open storage");
    let orchestrator = Orchestrator::from_config(1, &config, store.clone(), Arc::new(LogObserver))
        .expect("Failed to build orchestrator");

    let staged = orchestrator.run_once().await.expect("Iteration failed");
    assert_eq!(staged, 2);

    {
        let store = lock_store(&store).unwrap();
        assert_eq!(store.count().unwrap(), 2);

        let base = mock_server.uri();
        let urls = store.known_urls().unwrap();
        assert!(urls.contains(&format!("{}/sale/flat/1/", base)));
        assert!(urls.contains(&format!("{}/sale/flat/2/", base)));
        assert!(!urls.contains(&format!("{}/sale/flat/3/", base)));

        let recent = store.recent(10).unwrap();
        let flat1 = recent
            .iter()
            .find(|l| l.url.ends_with("/sale/flat/1/"))
            .expect("flat 1 stored");
        assert_eq!(flat1.title.as_deref(), Some("2-комн. квартира, 54 м²"));
        assert_eq!(flat1.price, Some(12_500_000.0));
        assert_eq!(flat1.currency.as_deref(), Some("RUB"));
        assert_eq!(flat1.rooms, Some(2));
        assert_eq!(flat1.address.as_deref(), Some("Москва, ул. Тверская, 7"));
        assert_eq!(flat1.area.as_deref(), Some("54 м²"));
        assert_eq!(flat1.images.len(), 2);
    }

    // Everything on the page is now known
    let staged = orchestrator.run_once().await.expect("Iteration failed");
    assert_eq!(staged, 0);

    let requests = mock_server.received_requests().await.unwrap();

    // Stored listings are not fetched again; flat 3 fails on both passes
    let detail_hits = |p: &str| requests.iter().filter(|r| r.url.path() == p).count();
    assert_eq!(detail_hits("/sale/flat/1/"), 1);
    assert_eq!(detail_hits("/sale/flat/2/"), 2);
    assert_eq!(detail_hits("/sale/flat/3/"), 6);
}

#[tokio::test]
async fn test_listings_survive_reopen() {
    let mock_server = MockServer::start().await;
    mount_site(&mock_server).await;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("listings.db");
    let config = create_test_config(&mock_server.uri(), &db_path);

    {
        let store = open_storage(&db_path).unwrap();
        let orchestrator =
            Orchestrator::from_config(1, &config, store, Arc::new(LogObserver)).unwrap();
        assert_eq!(orchestrator.run_once().await.unwrap(), 2);
    }

    let store = open_storage(&db_path).unwrap();
    let orchestrator =
        Orchestrator::from_config(2, &config, store.clone(), Arc::new(LogObserver)).unwrap();
    assert_eq!(orchestrator.run_once().await.unwrap(), 0);
    assert_eq!(lock_store(&store).unwrap().count().unwrap(), 2);
}

#[tokio::test]
async fn test_unavailable_index_page() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cat.php"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("listings.db");
    let config = create_test_config(&mock_server.uri(), &db_path);

    let store = open_storage(&db_path).unwrap();
    let orchestrator =
        Orchestrator::from_config(1, &config, store.clone(), Arc::new(LogObserver)).unwrap();

    let err = orchestrator.run_once().await.unwrap_err();
    assert!(matches!(err, WatchError::IndexUnavailable { .. }));
    assert_eq!(lock_store(&store).unwrap().count().unwrap(), 0);
}

#[tokio::test]
async fn test_registry_session_notifies_and_stops() {
    let mock_server = MockServer::start().await;
    mount_site(&mock_server).await;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("listings.db");
    let config = create_test_config(&mock_server.uri(), &db_path);

    let store = open_storage(&db_path).unwrap();
    let (observer, mut events) = ChannelObserver::new();
    let mut registry = SessionRegistry::new(config, store, Arc::new(observer));

    registry.start(42, BTreeMap::new()).await.unwrap();
    assert_eq!(registry.running_sessions(), vec![42]);

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("No notification within timeout")
        .expect("Channel closed");

    match event {
        SessionEvent::NewListings {
            session_id,
            listings,
        } => {
            assert_eq!(session_id, 42);
            assert_eq!(listings.len(), 2);
        }
        other => panic!("Unexpected event: {:?}", other),
    }

    // The session is sleeping now; stopping must not wait for the interval
    tokio::time::timeout(Duration::from_secs(5), registry.stop(42))
        .await
        .expect("Stop timed out")
        .unwrap();
    assert!(!registry.is_running(42));
}

#[tokio::test]
async fn test_registry_reports_failing_session_once() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cat.php"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&mock_server)
        .await;

    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let db_path = dir.path().join("listings.db");
    let mut config = create_test_config(&mock_server.uri(), &db_path);
    config.scraper.poll_interval_min_ms = 1;
    config.scraper.poll_interval_max_ms = 5;

    let store = open_storage(&db_path).unwrap();
    let (observer, mut events) = ChannelObserver::new();
    let mut registry = SessionRegistry::new(config, store, Arc::new(observer));

    registry.start(7, BTreeMap::new()).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("No error report within timeout")
        .expect("Channel closed");
    assert!(matches!(event, SessionEvent::Stopped { session_id: 7, .. }));

    let err = registry.stop(7).await.unwrap_err();
    assert!(matches!(err, WatchError::TooManyFailures { failures: 2, .. }));

    // Exactly one report, and the registry dropped the observer clone
    drop(registry);
    assert!(events.recv().await.is_none());
}
