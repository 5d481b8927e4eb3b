//! HTTP routes exercised through the router.

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use camrelay_api::build_router;
use serde_json::{Value, json};
use tower::ServiceExt;

async fn call(app: &axum::Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn with_bearer(uri: &str, method: Method, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

async fn login(app: &axum::Router) -> String {
    let (status, _, body) = call(
        app,
        post_json(
            "/auth/login",
            json!({ "username": common::USERNAME, "password": common::PASSWORD }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["token"].as_str().expect("token").to_string()
}

#[tokio::test]
async fn status_reports_idle_relay() {
    let app = build_router(common::signaling_harness().state);
    let (status, headers, body) = call(&app, get("/api/status")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!({ "relay_active": false, "receiver_connected": false, "sender_connected": false })
    );
    assert_eq!(headers["x-content-type-options"], "nosniff");
}

#[tokio::test]
async fn status_preflight_is_ok() {
    let app = build_router(common::signaling_harness().state);

    let bare = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/status")
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&app, bare).await;
    assert_eq!(status, StatusCode::OK);

    let cors = Request::builder()
        .method(Method::OPTIONS)
        .uri("/api/status")
        .header(header::ORIGIN, "http://example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "GET")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = call(&app, cors).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}

#[tokio::test]
async fn login_issues_a_token_that_validates() {
    let app = build_router(common::signaling_harness().state);

    let (status, headers, body) = call(
        &app,
        post_json(
            "/auth/login",
            json!({ "username": common::USERNAME, "password": common::PASSWORD }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Login successful");
    let cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("jwt="));
    assert!(cookie.contains("HttpOnly"));

    let token = body["token"].as_str().unwrap();
    let (status, _, body) = call(&app, with_bearer("/auth/validate", Method::POST, token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "tokenValid": true }));
}

#[tokio::test]
async fn bad_credentials_are_rejected() {
    let app = build_router(common::signaling_harness().state);

    let (status, _, body) = call(
        &app,
        post_json(
            "/auth/login",
            json!({ "username": common::USERNAME, "password": "wrong" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "INVALID_CREDENTIALS");

    let (status, _, body) = call(
        &app,
        post_json("/auth/login", json!({ "username": "", "password": "x" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "VALIDATION_ERROR");

    let (status, _, body) = call(&app, with_bearer("/auth/validate", Method::POST, "garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, json!({ "tokenValid": false }));
}

#[tokio::test]
async fn logout_clears_the_cookie() {
    let app = build_router(common::signaling_harness().state);
    let request = Request::builder()
        .method(Method::POST)
        .uri("/auth/logout")
        .header(header::COOKIE, "jwt=abc")
        .body(Body::empty())
        .unwrap();
    let (status, headers, _) = call(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    let cookie = headers[header::SET_COOKIE].to_str().unwrap();
    assert!(cookie.starts_with("jwt="));
    assert!(cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn management_routes_require_a_token() {
    let app = build_router(common::signaling_harness().state);

    let (status, _, _) = call(&app, get("/api/stats")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _, _) = call(
        &app,
        Request::builder()
            .method(Method::POST)
            .uri("/relay/start")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let token = login(&app).await;
    let (status, _, body) = call(&app, with_bearer("/api/stats", Method::GET, &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["sender"]["video"]["queued"], 0);

    let (status, _, body) = call(&app, with_bearer("/relay/start", Method::POST, &token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Relay started");

    // Cookie auth works too.
    let request = Request::builder()
        .uri("/api/stats")
        .header(header::COOKIE, format!("jwt={token}"))
        .body(Body::empty())
        .unwrap();
    let (status, _, _) = call(&app, request).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn capture_mode_hides_the_receiver_socket() {
    let app = build_router(common::capture_harness().state);

    let (status, _, _) = call(&app, get("/ws/receiver")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, _) = call(&app, get("/ws/sender")).await;
    assert_ne!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_and_page_are_served() {
    let app = build_router(common::signaling_harness().state);

    let (status, _, body) = call(&app, get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "camrelay");

    let response = app.clone().oneshot(get("/")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(std::str::from_utf8(&html).unwrap().contains("/app.js"));
}
