//! Retrying Request Client against a real local HTTP server.

use std::time::Duration;

use lib_common::pens::login;
use lib_common::retrieve::{ApiClient, ApiRequest, RetrieveError, RetryPolicy};
use project_tests::{MockHttpServer, Reply};
use serde_json::json;
use tokio_util::sync::CancellationToken;

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        timeout: Duration::from_millis(300),
        backoff: vec![
            Duration::from_millis(10),
            Duration::from_millis(20),
            Duration::from_millis(40),
        ],
    }
}

#[tokio::test]
async fn test_recovers_after_server_errors() {
    let server = MockHttpServer::start().await.unwrap();
    server.route(
        "/pens",
        vec![
            Reply::text(500, "boom"),
            Reply::text(502, "bad gateway"),
            Reply::json(200, json!({"piggeries": []})),
        ],
    );

    let api = ApiClient::new(&server.url(), fast_policy()).unwrap();
    let req = ApiRequest::get(api.endpoint(&["pens"]).unwrap())
        .bearer("tok")
        .unwrap();
    let body = api
        .request_with_retry(&req, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(body, json!({"piggeries": []}));
    let seen = server.requests();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|r| r.headers.get("authorization").map(String::as_str) == Some("Bearer tok")));
}

#[tokio::test]
async fn test_gives_up_after_four_attempts_with_last_error() {
    let server = MockHttpServer::start().await.unwrap();
    server.route(
        "/pens",
        vec![
            Reply::text(500, "first"),
            Reply::text(500, "second"),
            Reply::text(500, "third"),
            Reply::text(503, "last"),
        ],
    );

    let api = ApiClient::new(&server.url(), fast_policy()).unwrap();
    let req = ApiRequest::get(api.endpoint(&["pens"]).unwrap());
    let err = api
        .request_with_retry(&req, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        RetrieveError::Status { status, body } => {
            assert_eq!(status, 503);
            assert_eq!(body.as_deref(), Some("last"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn test_slow_responses_time_out() {
    let server = MockHttpServer::start().await.unwrap();
    server.route(
        "/pens",
        vec![Reply::json(200, json!({})).after(Duration::from_secs(2))],
    );

    let api = ApiClient::new(&server.url(), fast_policy()).unwrap();
    let req = ApiRequest::get(api.endpoint(&["pens"]).unwrap());
    let err = api
        .request_with_retry(&req, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RetrieveError::Timeout(_)));
    assert_eq!(server.requests().len(), 4);
}

#[tokio::test]
async fn test_invalid_json_is_a_decode_error() {
    let server = MockHttpServer::start().await.unwrap();
    server.route("/pens", vec![Reply::text(200, "<html>")]);

    let api = ApiClient::new(&server.url(), fast_policy()).unwrap();
    let req = ApiRequest::get(api.endpoint(&["pens"]).unwrap());
    let err = api
        .request_with_retry(&req, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, RetrieveError::Decode(_)));
}

#[tokio::test]
async fn test_login_posts_urlencoded_form() {
    let server = MockHttpServer::start().await.unwrap();
    server.route(
        "/auth/login",
        vec![Reply::json(200, json!({"access_token": "fresh", "token_type": "bearer", "expires_in": 120}))],
    );

    let api = ApiClient::new(&server.url(), fast_policy()).unwrap();
    let resp = login(&api, "farmer", "p&ss").await.unwrap();

    assert_eq!(resp.access_token, "fresh");
    assert_eq!(resp.expires_in, Duration::from_secs(120));

    let seen = server.requests();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].method, "POST");
    assert_eq!(
        seen[0].headers.get("content-type").map(String::as_str),
        Some("application/x-www-form-urlencoded")
    );
    assert_eq!(seen[0].body, "username=farmer&password=p%26ss");
}
