// ABOUTME: Resource middleware tests: bearer resolution, refresh, SSO forwarding
// ABOUTME: Wraps a probe handler to observe the injected request user
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Json;
use axum::routing::get;
use axum::{Extension, Router};
use common::{body_json, obtain_tokens, send, test_config, test_context, test_router};
use mcp_oauth_gateway::context::ServerContext;
use mcp_oauth_gateway::middleware::{optional_bearer, require_bearer, sso_access_token, RequestUser};

const REDIRECT_URI: &str = "http://127.0.0.1:8765/cb";

async fn me(Extension(user): Extension<RequestUser>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "email": user.info.email,
        "upstream_access_token": user.upstream_access_token,
    }))
}

async fn whoami(user: Option<Extension<RequestUser>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "authenticated": user.is_some(),
    }))
}

/// Protected API wrapped by the required bearer middleware.
fn protected_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/me", get(me))
        .layer(axum::middleware::from_fn_with_state(ctx, require_bearer))
}

/// API with the optional variant plus SSO forwarding after validation.
fn sso_router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route("/api/me", get(me))
        .route("/api/whoami", get(whoami))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            sso_access_token,
        ))
        .layer(axum::middleware::from_fn_with_state(ctx, optional_bearer))
}

fn bearer_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn missing_bearer_gets_challenge_with_discovery() {
    let (ctx, _idp) = test_context(test_config());
    let api = protected_router(ctx);

    let response = send(&api, bearer_request("/api/me", None)).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let challenge = response
        .headers()
        .get("www-authenticate")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(challenge.starts_with("Bearer realm="));
    assert!(challenge.contains("resource_metadata="));
    assert!(challenge.contains("/.well-known/oauth-protected-resource"));

    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_token");
}

#[tokio::test]
async fn malformed_authorization_header_is_rejected() {
    let (ctx, _idp) = test_context(test_config());
    let api = protected_router(ctx);

    let request = Request::builder()
        .uri("/api/me")
        .header("authorization", "Basic dXNlcjpwYXNz")
        .body(Body::empty())
        .unwrap();
    let response = send(&api, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn server_issued_bearer_resolves_to_the_user() {
    let (ctx, idp) = test_context(test_config());
    let oauth = test_router(ctx.clone());
    let api = protected_router(ctx);

    let tokens = obtain_tokens(&oauth, REDIRECT_URI).await;
    let access = tokens["access_token"].as_str().unwrap();

    let response = send(&api, bearer_request("/api/me", Some(access))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["email"], "user@example.com");
    assert!(json["upstream_access_token"]
        .as_str()
        .unwrap()
        .starts_with("up-access-"));
    assert!(idp.userinfo_calls.load(std::sync::atomic::Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn unknown_bearer_falls_back_to_provider_validation() {
    let (ctx, _idp) = test_context(test_config());
    let api = protected_router(ctx.clone());

    // Never issued by this server; validated against the provider directly.
    let response = send(&api, bearer_request("/api/me", Some("raw-provider-token"))).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["upstream_access_token"], "raw-provider-token");

    // The fallback re-keys the bearer so the next resolution is a store hit.
    let resolved = ctx.store.resolve_bearer("raw-provider-token").await.unwrap();
    assert_eq!(resolved.unwrap().user_email, "user@example.com");
}

#[tokio::test]
async fn rejected_upstream_token_yields_401() {
    let (ctx, idp) = test_context(test_config());
    let api = protected_router(ctx);

    *idp.fail_userinfo.lock().unwrap() = Some(
        mcp_oauth_gateway::idp::UpstreamError::Unauthorized("expired".to_owned()),
    );
    let response = send(&api, bearer_request("/api/me", Some("whatever"))).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_token");
    assert!(json["error_description"]
        .as_str()
        .unwrap()
        .contains("Re-authenticate"));
}

#[tokio::test]
async fn provider_outage_yields_503() {
    let (ctx, idp) = test_context(test_config());
    let api = protected_router(ctx);

    *idp.fail_userinfo.lock().unwrap() = Some(
        mcp_oauth_gateway::idp::UpstreamError::Unavailable("502 Bad Gateway".to_owned()),
    );
    let response = send(&api, bearer_request("/api/me", Some("whatever"))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn expiring_upstream_token_is_refreshed_and_rekeyed() {
    let (ctx, idp) = test_context(test_config());
    let oauth = test_router(ctx.clone());
    let api = protected_router(ctx.clone());

    // Upstream tokens from the exchange live 100 seconds: past the exchange
    // skew (60 s) but inside the middleware refresh threshold (300 s).
    *idp.exchange_expires_in.lock().unwrap() = 100;

    let tokens = obtain_tokens(&oauth, REDIRECT_URI).await;
    let access = tokens["access_token"].as_str().unwrap();
    assert_eq!(idp.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 0);

    let response = send(&api, bearer_request("/api/me", Some(access))).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(idp.refresh_calls.load(std::sync::atomic::Ordering::SeqCst), 1);

    // The refreshed token is persisted under both keys.
    let by_email = ctx
        .store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .unwrap();
    assert!(by_email.access_token.contains("refreshed"));
    let resolved = ctx.store.resolve_bearer(access).await.unwrap().unwrap();
    assert!(resolved.upstream.access_token.contains("refreshed"));
}

#[tokio::test]
async fn refresh_failure_does_not_fail_the_request() {
    let (ctx, idp) = test_context(test_config());
    let oauth = test_router(ctx.clone());
    let api = protected_router(ctx);

    *idp.exchange_expires_in.lock().unwrap() = 100;
    let tokens = obtain_tokens(&oauth, REDIRECT_URI).await;
    let access = tokens["access_token"].as_str().unwrap();

    *idp.fail_refresh.lock().unwrap() = Some(
        mcp_oauth_gateway::idp::UpstreamError::Network("connection reset".to_owned()),
    );
    let response = send(&api, bearer_request("/api/me", Some(access))).await;
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn per_user_limit_returns_429_with_retry_after() {
    let mut config = test_config();
    config.rate_limit.user_rate = 0.001;
    config.rate_limit.user_burst = 2;
    let (ctx, _idp) = test_context(config);
    let api = protected_router(ctx);

    for _ in 0..2 {
        let response = send(&api, bearer_request("/api/me", Some("tok"))).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let limited = send(&api, bearer_request("/api/me", Some("tok"))).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(limited.headers().get("retry-after").unwrap(), "1");
}

#[tokio::test]
async fn optional_variant_passes_anonymous_requests() {
    let (ctx, idp) = test_context(test_config());
    let api = sso_router(ctx);

    let response = send(&api, bearer_request("/api/whoami", None)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["authenticated"], false);
    assert_eq!(idp.userinfo_calls.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn sso_header_stores_and_injects_the_forwarded_token() {
    let (ctx, _idp) = test_context(test_config());
    let api = sso_router(ctx.clone());

    let request = Request::builder()
        .uri("/api/me")
        .header("authorization", "Bearer some-valid-token")
        .header("x-google-access-token", "forwarded-access")
        .header("x-google-refresh-token", "forwarded-refresh")
        .body(Body::empty())
        .unwrap();
    let response = send(&api, request).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["upstream_access_token"], "forwarded-access");

    let stored = ctx
        .store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.access_token, "forwarded-access");
    assert_eq!(stored.refresh_token.as_deref(), Some("forwarded-refresh"));
}

#[tokio::test]
async fn sso_expiry_header_is_honored() {
    let (ctx, _idp) = test_context(test_config());
    let api = sso_router(ctx.clone());

    let request = Request::builder()
        .uri("/api/me")
        .header("authorization", "Bearer some-valid-token")
        .header("x-google-access-token", "forwarded-access")
        .header("x-google-token-expiry", "2030-01-02T03:04:05Z")
        .body(Body::empty())
        .unwrap();
    let response = send(&api, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    let stored = ctx
        .store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        stored.expires_at.to_rfc3339(),
        "2030-01-02T03:04:05+00:00"
    );
}

#[tokio::test]
async fn sso_without_user_passes_through() {
    let (ctx, _idp) = test_context(test_config());
    let api = sso_router(ctx.clone());

    let request = Request::builder()
        .uri("/api/whoami")
        .header("x-google-access-token", "forwarded-access")
        .body(Body::empty())
        .unwrap();
    let response = send(&api, request).await;
    assert_eq!(response.status(), StatusCode::OK);

    // Nothing stored without an authenticated user.
    assert!(ctx
        .store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .is_none());
}
