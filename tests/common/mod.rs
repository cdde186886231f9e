// ABOUTME: Shared test harness: mock identity provider, context builders, PKCE helpers
// ABOUTME: Drives the full router through tower oneshot with a connected peer
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, Response, StatusCode};
use axum::Router;
use base64::{engine::general_purpose, Engine as _};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use tower::ServiceExt;

use mcp_oauth_gateway::config::{RateLimitSettings, ServerConfig};
use mcp_oauth_gateway::context::ServerContext;
use mcp_oauth_gateway::idp::{AuthUrlParams, IdentityProvider, UpstreamError};
use mcp_oauth_gateway::models::{UpstreamToken, UserInfo};
use mcp_oauth_gateway::oauth2::{self, routes::attach_peer};

/// Scriptable in-process identity provider.
pub struct MockIdp {
    /// Email returned by userinfo.
    pub email: Mutex<String>,
    /// Lifetime of tokens handed out by exchange, in seconds.
    pub exchange_expires_in: Mutex<i64>,
    /// Lifetime of tokens handed out by refresh, in seconds.
    pub refresh_expires_in: Mutex<i64>,
    /// Error injected into the next exchange call.
    pub fail_exchange: Mutex<Option<UpstreamError>>,
    /// Error injected into every refresh call.
    pub fail_refresh: Mutex<Option<UpstreamError>>,
    /// Error injected into every userinfo call.
    pub fail_userinfo: Mutex<Option<UpstreamError>>,
    /// Number of refresh calls observed.
    pub refresh_calls: AtomicUsize,
    /// Number of userinfo calls observed.
    pub userinfo_calls: AtomicUsize,
}

impl Default for MockIdp {
    fn default() -> Self {
        Self {
            email: Mutex::new("user@example.com".to_owned()),
            exchange_expires_in: Mutex::new(3600),
            refresh_expires_in: Mutex::new(3600),
            fail_exchange: Mutex::new(None),
            fail_refresh: Mutex::new(None),
            fail_userinfo: Mutex::new(None),
            refresh_calls: AtomicUsize::new(0),
            userinfo_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl IdentityProvider for MockIdp {
    fn authorization_url(&self, params: &AuthUrlParams<'_>) -> String {
        format!(
            "https://idp.test/auth?client_id=mock&redirect_uri={}&state={}&scope={}&prompt={}",
            urlencoding::encode(params.redirect_uri),
            urlencoding::encode(params.state),
            urlencoding::encode(params.scope),
            urlencoding::encode(params.prompt.unwrap_or("consent")),
        )
    }

    async fn exchange_code(
        &self,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<UpstreamToken, UpstreamError> {
        if let Some(error) = self.fail_exchange.lock().unwrap().take() {
            return Err(error);
        }
        let expires_in = *self.exchange_expires_in.lock().unwrap();
        Ok(UpstreamToken {
            access_token: format!("up-access-{code}"),
            refresh_token: Some("up-refresh-1".to_owned()),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken, UpstreamError> {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(error) = self.fail_refresh.lock().unwrap().clone() {
            return Err(error);
        }
        let expires_in = *self.refresh_expires_in.lock().unwrap();
        Ok(UpstreamToken {
            access_token: format!("up-access-refreshed-{call}"),
            refresh_token: Some(refresh_token.to_owned()),
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }

    async fn userinfo(&self, _access_token: &str) -> Result<UserInfo, UpstreamError> {
        self.userinfo_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.fail_userinfo.lock().unwrap().clone() {
            return Err(error);
        }
        Ok(UserInfo {
            email: self.email.lock().unwrap().clone(),
            name: Some("Test User".to_owned()),
            picture: None,
            email_verified: Some(true),
        })
    }
}

/// Base configuration for tests: loopback issuer, limiter layers disabled.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        rate_limit: RateLimitSettings {
            rate: 0.0,
            burst: 0,
            user_rate: 0.0,
            user_burst: 0,
        },
        ..ServerConfig::default()
    }
}

/// Build a context over a mock provider.
pub fn test_context(config: ServerConfig) -> (Arc<ServerContext>, Arc<MockIdp>) {
    let idp = Arc::new(MockIdp::default());
    let ctx = ServerContext::new(config, idp.clone());
    (ctx, idp)
}

/// Default peer address for requests driven through the router.
pub fn peer() -> SocketAddr {
    "198.51.100.1:55000".parse().unwrap()
}

/// Send a request through a clone of the router, tagging it with a peer.
pub async fn send(router: &Router, mut request: Request<Body>) -> Response<Body> {
    attach_peer(&mut request, peer());
    router.clone().oneshot(request).await.unwrap()
}

/// Send a request with an explicit peer address.
pub async fn send_from(
    router: &Router,
    addr: SocketAddr,
    mut request: Request<Body>,
) -> Response<Body> {
    attach_peer(&mut request, addr);
    router.clone().oneshot(request).await.unwrap()
}

/// Collect a response body as JSON.
pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    }
}

/// Generate a PKCE code verifier (43 base64url characters).
pub fn generate_code_verifier() -> String {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    let mut random_bytes = [0u8; 32];
    rng.fill(&mut random_bytes).unwrap();
    general_purpose::URL_SAFE_NO_PAD.encode(random_bytes)
}

/// Compute the S256 code challenge for a verifier.
pub fn generate_code_challenge(code_verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code_verifier.as_bytes());
    general_purpose::URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Register a public client over HTTP and return its client_id.
pub async fn register_public_client(router: &Router, redirect_uri: &str) -> String {
    let body = serde_json::json!({
        "redirect_uris": [redirect_uri],
        "client_name": "Test Client",
    });
    let request = Request::builder()
        .method("POST")
        .uri("/oauth/register")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = send(router, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    json["client_id"].as_str().unwrap().to_owned()
}

/// Register a confidential client, returning (client_id, client_secret).
pub async fn register_confidential_client(
    router: &Router,
    redirect_uri: &str,
) -> (String, String) {
    let body = serde_json::json!({
        "redirect_uris": [redirect_uri],
        "client_name": "Confidential Client",
        "client_type": "confidential",
        "token_endpoint_auth_method": "client_secret_post",
    });
    let request = Request::builder()
        .method("POST")
        .uri("/oauth/register")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = send(router, request).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    (
        json["client_id"].as_str().unwrap().to_owned(),
        json["client_secret"].as_str().unwrap().to_owned(),
    )
}

/// Query parameters of a URL as a map.
pub fn query_params(url: &str) -> HashMap<String, String> {
    let parsed = url::Url::parse(url).unwrap();
    parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Drive `/oauth/authorize` then `/oauth/callback` and return the
/// authorization code and echoed state from the final client redirect.
pub async fn run_authorization_flow(
    router: &Router,
    client_id: &str,
    redirect_uri: &str,
    code_challenge: &str,
    state: &str,
) -> (String, Option<String>) {
    let uri = format!(
        "/oauth/authorize?client_id={}&redirect_uri={}&response_type=code&state={}&code_challenge={}&code_challenge_method=S256",
        urlencoding::encode(client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(state),
        urlencoding::encode(code_challenge),
    );
    let response = send(
        router,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    let upstream_state = query_params(&location).remove("state").unwrap();

    // Simulate the provider redirecting back with a code.
    let callback_uri = format!(
        "/oauth/callback?state={}&code=iC",
        urlencoding::encode(&upstream_state)
    );
    let response = send(
        router,
        Request::builder()
            .uri(callback_uri)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response
        .headers()
        .get("location")
        .unwrap()
        .to_str()
        .unwrap()
        .to_owned();
    assert!(location.starts_with(redirect_uri));
    let mut params = query_params(&location);
    (params.remove("code").unwrap(), params.remove("state"))
}

/// Post a form to `/oauth/token` and return the raw response.
pub async fn post_token_form(router: &Router, fields: &[(&str, &str)]) -> Response<Body> {
    let body = serde_urlencoded::to_string(fields).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/oauth/token")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from(body))
        .unwrap();
    send(router, request).await
}

/// Full happy path: register, authorize, callback, exchange. Returns the
/// parsed token response JSON.
pub async fn obtain_tokens(router: &Router, redirect_uri: &str) -> serde_json::Value {
    let client_id = register_public_client(router, redirect_uri).await;
    let verifier = generate_code_verifier();
    let challenge = generate_code_challenge(&verifier);
    let (code, _state) =
        run_authorization_flow(router, &client_id, redirect_uri, &challenge, "s1").await;

    let response = post_token_form(
        router,
        &[
            ("grant_type", "authorization_code"),
            ("code", &code),
            ("redirect_uri", redirect_uri),
            ("client_id", &client_id),
            ("code_verifier", &verifier),
        ],
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

/// Build the standard test router.
pub fn test_router(ctx: Arc<ServerContext>) -> Router {
    oauth2::router(ctx)
}
