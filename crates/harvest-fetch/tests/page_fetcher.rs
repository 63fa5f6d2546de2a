use std::sync::Arc;
use std::time::Duration;

use harvest_core::{
    FeedDescriptor, HarvestEvent, MemorySink, RecordingSleeper, RetryCause, SkipReason,
};
use harvest_fetch::{BackoffPolicy, FetchError, HttpClientConfig, PageFetcher};
use serde_json::json;
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, ResponseTemplate,
};

const INITIAL: Duration = Duration::from_millis(50);

fn fetcher(max_attempts: u32) -> (PageFetcher, Arc<RecordingSleeper>, Arc<MemorySink>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let events = Arc::new(MemorySink::new());
    let fetcher = PageFetcher::new(
        HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("harvest-test/0.1".into()),
            backoff: BackoffPolicy {
                max_attempts,
                initial_delay: INITIAL,
                multiplier: 2,
            },
        },
        sleeper.clone(),
        events.clone(),
    )
    .expect("fetcher");
    (fetcher, sleeper, events)
}

fn feed(server: &MockServer) -> FeedDescriptor {
    FeedDescriptor::new("apartments-sale", format!("{}/api/items/", server.uri()))
        .with_param("rubric", "3528")
}

fn page_body() -> serde_json::Value {
    json!({
        "count": 2,
        "next": "https://www.bazaraki.com/api/items/?rubric=3528&page=2",
        "results": [
            {"id": 101, "title": "Studio", "slug": "studio", "price": "85000.00",
             "currency": "EUR"},
            {"id": 102, "title": "Loft", "slug": "loft", "price": "1500.50", "currency": "EUR"}
        ]
    })
}

#[tokio::test]
async fn three_unavailable_responses_then_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .expect(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .and(query_param("page", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body()))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, sleeper, events) = fetcher(10);
    let page = fetcher.fetch_page(&feed(&server), 1).await.expect("page");

    assert_eq!(page.results.len(), 2);
    assert!(page.has_more());
    assert_eq!(sleeper.total(), INITIAL * (1 + 2 + 4));
    assert_eq!(sleeper.delays(), vec![INITIAL, INITIAL * 2, INITIAL * 4]);

    let retries = events
        .events()
        .into_iter()
        .filter(|e| matches!(e, HarvestEvent::FetchRetry { cause: RetryCause::Status(503), .. }))
        .count();
    assert_eq!(retries, 3);
}

#[tokio::test]
async fn not_found_is_fatal_without_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, sleeper, events) = fetcher(10);
    let err = fetcher.fetch_page(&feed(&server), 1).await.unwrap_err();

    assert!(matches!(err, FetchError::HttpStatus { status: 404, page: 1, .. }));
    assert!(sleeper.delays().is_empty());
    assert!(events.events().is_empty());
}

#[tokio::test]
async fn forbidden_and_rate_limited_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(page_body()))
        .mount(&server)
        .await;

    let (fetcher, sleeper, _events) = fetcher(5);
    let page = fetcher.fetch_page(&feed(&server), 1).await.expect("page");

    assert_eq!(page.results[1].price, "1500.50");
    assert_eq!(sleeper.delays(), vec![INITIAL, INITIAL * 2]);
}

#[tokio::test]
async fn attempt_budget_exhaustion_is_fatal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;

    let (fetcher, sleeper, _events) = fetcher(3);
    let err = fetcher.fetch_page(&feed(&server), 4).await.unwrap_err();

    match err {
        FetchError::RetriesExhausted {
            page,
            attempts,
            last_cause,
            ..
        } => {
            assert_eq!(page, 4);
            assert_eq!(attempts, 3);
            assert_eq!(last_cause, RetryCause::Status(500));
        }
        other => panic!("unexpected error: {other}"),
    }
    // no wait after the final attempt
    assert_eq!(sleeper.delays(), vec![INITIAL, INITIAL * 2]);
}

#[tokio::test]
async fn connection_failures_are_retryable() {
    let (fetcher, sleeper, events) = fetcher(2);
    let feed = FeedDescriptor::new("unreachable", "http://127.0.0.1:9/api/items/");

    let err = fetcher.fetch_page(&feed, 1).await.unwrap_err();

    assert!(matches!(
        err,
        FetchError::RetriesExhausted {
            attempts: 2,
            last_cause: RetryCause::Transport(_),
            ..
        }
    ));
    assert_eq!(sleeper.delays(), vec![INITIAL]);
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, HarvestEvent::FetchRetry { cause: RetryCause::Transport(_), .. })));
}

#[tokio::test]
async fn malformed_body_yields_an_empty_final_page() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>maintenance</html>"))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, _sleeper, events) = fetcher(3);
    let page = fetcher.fetch_page(&feed(&server), 1).await.expect("tolerated");

    assert!(page.results.is_empty());
    assert!(!page.has_more());
    assert!(events
        .events()
        .iter()
        .any(|e| matches!(e, HarvestEvent::MalformedPage { page: 1, .. })));
}

#[tokio::test]
async fn mistyped_listing_is_dropped_but_page_and_continuation_survive() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 3,
            "next": "https://www.bazaraki.com/api/items/?rubric=3528&page=2",
            "results": [
                {"id": 1, "slug": "one", "price": "10"},
                {"id": 2, "slug": "two", "price": 1500},
                {"id": 3, "slug": "three", "price": "30"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, sleeper, events) = fetcher(3);
    let page = fetcher.fetch_page(&feed(&server), 1).await.expect("page");

    assert_eq!(page.results.iter().map(|l| l.id).collect::<Vec<_>>(), vec![1, 3]);
    assert!(page.has_more());
    assert_eq!(page.count, 3);
    assert!(sleeper.delays().is_empty());

    let events = events.events();
    assert!(events.iter().any(|e| matches!(
        e,
        HarvestEvent::RecordSkipped { id: 2, reason: SkipReason::Undecodable(_) }
    )));
    assert!(!events
        .iter()
        .any(|e| matches!(e, HarvestEvent::MalformedPage { .. })));
}

#[tokio::test]
async fn feed_params_and_page_number_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/items/"))
        .and(query_param("rubric", "3528"))
        .and(query_param("page", "7"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "count": 0,
            "next": "",
            "results": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let (fetcher, _sleeper, events) = fetcher(1);
    let page = fetcher.fetch_page(&feed(&server), 7).await.expect("page");

    assert!(!page.has_more());
    assert_eq!(
        events.events(),
        vec![HarvestEvent::PageFetched {
            feed: "apartments-sale".into(),
            page: 7,
            records: 0,
            advertised_total: 0,
        }]
    );
}
