//! Retry and backoff behavior against a mock SAM endpoint.

use std::time::{Duration, Instant};

use chrono::NaiveDate;
use samops_client::{BackoffPolicy, ClientConfig, DateWindow, FetchError, PageFilters, SamClient};
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn test_client(server: &MockServer, max_attempts: usize) -> SamClient {
    SamClient::new(ClientConfig {
        endpoint: format!("{}/search", server.uri()),
        api_key: "test-key".into(),
        timeout: Duration::from_secs(5),
        user_agent: None,
        backoff: BackoffPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
        },
    })
    .expect("client")
}

fn window() -> DateWindow {
    DateWindow::new(
        NaiveDate::from_ymd_opt(2025, 8, 1).unwrap(),
        NaiveDate::from_ymd_opt(2025, 8, 6).unwrap(),
    )
    .unwrap()
}

fn envelope(count: usize) -> serde_json::Value {
    let records: Vec<_> = (0..count)
        .map(|i| json!({"noticeId": format!("N{i}"), "title": format!("Notice {i}")}))
        .collect();
    json!({"result": {"opportunitiesData": records, "totalRecords": count}})
}

#[tokio::test]
async fn fetch_page_sends_the_upstream_contract() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .and(query_param("api_key", "test-key"))
        .and(query_param("postedFrom", "08/01/2025"))
        .and(query_param("postedTo", "08/06/2025"))
        .and(query_param("limit", "10"))
        .and(query_param("offset", "20"))
        .and(query_param("zipcode", "98661"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(2)))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server, 3);
    let filters = PageFilters {
        zip: Some("98661".into()),
        ..Default::default()
    };
    let page = client
        .fetch_page(&window(), 10, 20, &filters)
        .await
        .expect("fetch");
    assert_eq!(page.records.len(), 2);
    assert_eq!(page.total_records, 2);
}

#[tokio::test]
async fn rate_limit_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(1)))
        .mount(&server)
        .await;

    let client = test_client(&server, 5);
    let page = client
        .fetch_page(&window(), 10, 0, &PageFilters::default())
        .await
        .expect("fetch should survive two 429s");
    assert_eq!(page.records.len(), 1);
}

#[tokio::test]
async fn rate_limit_budget_is_bounded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429))
        .expect(3)
        .mount(&server)
        .await;

    let client = test_client(&server, 3);
    let err = client
        .fetch_page(&window(), 10, 0, &PageFilters::default())
        .await
        .expect_err("budget must be enforced");
    match err {
        FetchError::RetriesExhausted {
            attempts,
            last_status,
        } => {
            assert_eq!(attempts, 3);
            assert_eq!(last_status, Some(429));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried_separately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(3)))
        .mount(&server)
        .await;

    let client = test_client(&server, 4);
    let page = client
        .fetch_page(&window(), 10, 0, &PageFilters::default())
        .await
        .expect("fetch should survive two 503s");
    assert_eq!(page.records.len(), 3);
}

#[tokio::test]
async fn client_errors_fail_without_retry() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = test_client(&server, 5);
    let err = client
        .fetch_page(&window(), 10, 0, &PageFilters::default())
        .await
        .expect_err("4xx is a request-shape bug");
    assert!(matches!(err, FetchError::HttpStatus { status: 400, .. }));
}

#[tokio::test]
async fn retry_after_is_honored_but_clamped() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3600"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/search"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope(1)))
        .mount(&server)
        .await;

    let client = test_client(&server, 3);
    let started = Instant::now();
    client
        .fetch_page(&window(), 10, 0, &PageFilters::default())
        .await
        .expect("fetch");
    // an honored-but-unclamped Retry-After of one hour would hang here; the
    // clamp caps the sleep at max_delay (20ms) plus jitter
    assert!(started.elapsed() < Duration::from_secs(2));
}
