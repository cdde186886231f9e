// ABOUTME: Redirect-URI policy tests through the registration endpoint
// ABOUTME: Production https enforcement, blocklisted schemes, loopback carve-outs
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{body_json, send, test_config, test_context, test_router};

async fn register_with_uri(router: &axum::Router, uri: &str) -> StatusCode {
    let request = Request::builder()
        .method("POST")
        .uri("/oauth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "redirect_uris": [uri] }).to_string(),
        ))
        .unwrap();
    send(router, request).await.status()
}

#[tokio::test]
async fn development_mode_accepts_http_and_custom_schemes() {
    let (ctx, _idp) = test_context(test_config());
    let router = test_router(ctx);

    for uri in [
        "http://127.0.0.1:8765/cb",
        "http://localhost:3000/oauth",
        "https://app.example.com/cb",
        "myapp://oauth/callback",
    ] {
        assert_eq!(
            register_with_uri(&router, uri).await,
            StatusCode::CREATED,
            "{uri} should register"
        );
    }
}

#[tokio::test]
async fn blocklisted_schemes_never_register() {
    let (ctx, _idp) = test_context(test_config());
    let router = test_router(ctx);

    for uri in [
        "javascript:alert(1)",
        "data:text/html;base64,PGI+",
        "file:///etc/hosts",
        "vbscript:MsgBox",
        "about:blank",
    ] {
        assert_eq!(
            register_with_uri(&router, uri).await,
            StatusCode::BAD_REQUEST,
            "{uri} must be rejected"
        );
    }
}

#[tokio::test]
async fn production_mode_requires_https_except_loopback() {
    let mut config = test_config();
    config.redirect_uri_security.production_mode = true;
    let (ctx, _idp) = test_context(config);
    let router = test_router(ctx);

    // Loopback stays permitted even in production.
    for uri in [
        "http://127.0.0.1:8765/cb",
        "http://localhost:9000/cb",
        "http://[::1]:8080/cb",
    ] {
        assert_eq!(
            register_with_uri(&router, uri).await,
            StatusCode::CREATED,
            "{uri} should register in production"
        );
    }

    // Public http is not.
    assert_eq!(
        register_with_uri(&router, "http://app.example.com/cb").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        register_with_uri(&router, "https://app.example.com/cb").await,
        StatusCode::CREATED
    );
}

#[tokio::test]
async fn fragments_and_relative_uris_are_rejected() {
    let (ctx, _idp) = test_context(test_config());
    let router = test_router(ctx);

    for uri in ["https://app.example.com/cb#token", "/relative", "not a uri"] {
        let status = register_with_uri(&router, uri).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{uri} must be rejected");
    }
}

#[tokio::test]
async fn rejection_names_the_offending_uri() {
    let (ctx, _idp) = test_context(test_config());
    let router = test_router(ctx);

    let request = Request::builder()
        .method("POST")
        .uri("/oauth/register")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({
                "redirect_uris": ["https://good.example.com/cb", "javascript:alert(1)"]
            })
            .to_string(),
        ))
        .unwrap();
    let response = send(&router, request).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_redirect_uri");
    assert!(json["error_description"]
        .as_str()
        .unwrap()
        .contains("javascript"));
}

#[tokio::test]
async fn authorize_requires_exact_registered_match() {
    let (ctx, _idp) = test_context(test_config());
    let router = test_router(ctx);
    let client_id = common::register_public_client(&router, "http://127.0.0.1:8765/cb").await;

    let uri = format!(
        "/oauth/authorize?client_id={client_id}&redirect_uri={}&response_type=code&state=s",
        urlencoding::encode("http://127.0.0.1:8765/cb/extra"),
    );
    let response = send(
        &router,
        Request::builder().uri(uri).body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"], "invalid_redirect_uri");
}
