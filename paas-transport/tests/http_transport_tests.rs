// HttpTransport against a local mock HTTP server

use bytes::Bytes;
use paas_core::{Method, TransportError};
use paas_transport::{HttpRequest, HttpTransport, Transport};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_get_forwards_headers_and_returns_body() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/1.1/classes/Foo/abc")
        .match_header("x-lc-id", "app")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_header("etag", "\"v1\"")
        .with_body(r#"{"objectId":"abc"}"#)
        .create_async()
        .await;

    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let mut request = HttpRequest::new(Method::Get, format!("{}/1.1/classes/Foo/abc", server.url()));
    request.headers.insert("X-LC-Id".into(), "app".into());

    let response = transport.execute(request).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.header("ETag"), Some("\"v1\""));
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body, json!({"objectId": "abc"}));

    mock.assert_async().await;
}

#[tokio::test]
async fn test_post_sends_body_and_error_status_is_a_response() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/1.1/classes/Post")
        .match_body(mockito::Matcher::Json(json!({"title": "hi"})))
        .with_status(400)
        .with_body(r#"{"code":142,"error":"bad"}"#)
        .create_async()
        .await;

    let transport = HttpTransport::new(Duration::from_secs(5)).unwrap();
    let mut request = HttpRequest::new(Method::Post, format!("{}/1.1/classes/Post", server.url()));
    request.body = Some(Bytes::from(json!({"title": "hi"}).to_string()));

    let response = transport.execute(request).await.unwrap();
    assert_eq!(response.status, 400);
    assert!(!response.is_success());

    mock.assert_async().await;
}

#[tokio::test]
async fn test_unreachable_host_is_transport_error() {
    let transport = HttpTransport::new(Duration::from_secs(2)).unwrap();
    let request = HttpRequest::new(Method::Get, "http://127.0.0.1:1/1.1/classes/Foo");

    let err = transport.execute(request).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::Connection(_) | TransportError::Timeout(_)
    ));
}
