// ABOUTME: Store concurrency and lifecycle tests: single-use codes, TTLs, stop
// ABOUTME: Exercises sealing at rest and email/bearer pair consistency
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use chrono::{Duration, Utc};
use mcp_oauth_gateway::crypto::TokenCipher;
use mcp_oauth_gateway::models::{
    AuthorizationCode, FlowState, RefreshTokenRecord, UpstreamToken,
};
use mcp_oauth_gateway::store::AuthStore;

fn upstream(access: &str) -> UpstreamToken {
    UpstreamToken {
        access_token: access.to_owned(),
        refresh_token: Some("refresh".to_owned()),
        expires_at: Utc::now() + Duration::hours(1),
    }
}

fn auth_code(expires_in_secs: i64) -> AuthorizationCode {
    let now = Utc::now();
    AuthorizationCode {
        client_id: "client-1".to_owned(),
        redirect_uri: "http://127.0.0.1/cb".to_owned(),
        scope: "openid".to_owned(),
        pkce: None,
        upstream: upstream("up-1"),
        user_email: "user@example.com".to_owned(),
        created_at: now,
        expires_at: now + Duration::seconds(expires_in_secs),
    }
}

fn flow_state(expires_in_secs: i64) -> FlowState {
    let now = Utc::now();
    FlowState {
        client_state: Some("s".to_owned()),
        client_id: "client-1".to_owned(),
        redirect_uri: "http://127.0.0.1/cb".to_owned(),
        scope: "openid".to_owned(),
        pkce: None,
        nonce: None,
        prompt: None,
        created_at: now,
        expires_at: now + Duration::seconds(expires_in_secs),
    }
}

#[tokio::test]
async fn auth_code_single_use_under_concurrency() {
    let store = Arc::new(AuthStore::new(TokenCipher::disabled()));
    store
        .put_auth_code("the-code".to_owned(), auth_code(600))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..32 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            store.take_auth_code("the-code").await.unwrap().is_some()
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1, "exactly one redemption may succeed");
}

#[tokio::test]
async fn expired_artifacts_resolve_to_none() {
    let store = AuthStore::new(TokenCipher::disabled());

    store
        .put_auth_code("expired".to_owned(), auth_code(-1))
        .await
        .unwrap();
    assert!(store.take_auth_code("expired").await.unwrap().is_none());

    store
        .put_flow_state("stale".to_owned(), flow_state(-1))
        .await;
    assert!(store.take_flow_state("stale").await.is_none());

    store
        .put_refresh_token(
            "old".to_owned(),
            RefreshTokenRecord {
                user_email: "user@example.com".to_owned(),
                expires_at: Utc::now() - Duration::seconds(1),
            },
        )
        .await;
    assert!(store.get_refresh_token("old").await.is_none());
}

#[tokio::test]
async fn sealing_round_trips_through_the_store() {
    let store = AuthStore::new(TokenCipher::new(Some([9u8; 32])));
    store
        .save_upstream_token("user@example.com", &upstream("secret-access"), None)
        .await
        .unwrap();

    let loaded = store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(loaded.access_token, "secret-access");
    assert_eq!(loaded.refresh_token.as_deref(), Some("refresh"));
}

#[tokio::test]
async fn bearer_and_email_keys_stay_consistent() {
    let store = AuthStore::new(TokenCipher::disabled());
    let expiry = Utc::now() + Duration::hours(1);

    store
        .save_upstream_token("user@example.com", &upstream("up-A"), Some(("bearer-1", expiry)))
        .await
        .unwrap();
    store
        .save_upstream_token("user@example.com", &upstream("up-B"), Some(("bearer-2", expiry)))
        .await
        .unwrap();

    // Both bearers resolve to the single current upstream token.
    let via_1 = store.resolve_bearer("bearer-1").await.unwrap().unwrap();
    let via_2 = store.resolve_bearer("bearer-2").await.unwrap().unwrap();
    assert_eq!(via_1.upstream.access_token, "up-B");
    assert_eq!(via_2.upstream.access_token, "up-B");

    store.remove_user_tokens("user@example.com").await;
    assert!(store.resolve_bearer("bearer-1").await.unwrap().is_none());
    assert!(store.resolve_bearer("bearer-2").await.unwrap().is_none());
    assert!(store
        .get_upstream_by_email("user@example.com")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn expired_bearer_does_not_resolve() {
    let store = AuthStore::new(TokenCipher::disabled());
    store
        .save_upstream_token(
            "user@example.com",
            &upstream("up-A"),
            Some(("bearer-1", Utc::now() - Duration::seconds(1))),
        )
        .await
        .unwrap();
    assert!(store.resolve_bearer("bearer-1").await.unwrap().is_none());
}

#[tokio::test]
async fn rotation_retires_the_old_token_atomically() {
    let store = AuthStore::new(TokenCipher::disabled());
    let record = RefreshTokenRecord {
        user_email: "user@example.com".to_owned(),
        expires_at: Utc::now() + Duration::days(30),
    };
    store.put_refresh_token("r0".to_owned(), record.clone()).await;

    store
        .rotate_refresh_token("r0", "r1".to_owned(), record)
        .await;

    assert!(store.get_refresh_token("r0").await.is_none());
    assert!(store.get_refresh_token("r1").await.is_some());
    assert_eq!(
        store.rotated_owner("r0").await.as_deref(),
        Some("user@example.com")
    );

    let revoked = store.revoke_refresh_tokens_for("user@example.com").await;
    assert_eq!(revoked, 1);
    assert!(store.get_refresh_token("r1").await.is_none());
    assert!(store.rotated_owner("r0").await.is_none());
}

#[tokio::test]
async fn sweep_removes_expired_entries() {
    let store = AuthStore::new(TokenCipher::disabled());
    store
        .put_auth_code("dead".to_owned(), auth_code(-10))
        .await
        .unwrap();
    store
        .put_auth_code("alive".to_owned(), auth_code(600))
        .await
        .unwrap();
    store.put_flow_state("dead".to_owned(), flow_state(-10)).await;
    store
        .save_upstream_token(
            "user@example.com",
            &upstream("up"),
            Some(("dead-bearer", Utc::now() - Duration::seconds(10))),
        )
        .await
        .unwrap();

    store.sweep_once(Utc::now()).await;

    // The live code is still redeemable once.
    assert!(store.take_auth_code("alive").await.unwrap().is_some());
    assert!(store.take_auth_code("dead").await.unwrap().is_none());
    assert!(store.resolve_bearer("dead-bearer").await.unwrap().is_none());
}

#[tokio::test]
async fn stop_is_idempotent_under_concurrent_callers() {
    let store = Arc::new(AuthStore::new(TokenCipher::disabled()));
    store.start_sweeper(std::time::Duration::from_secs(3600));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.stop().await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(store.is_stopped());

    // Calling again after completion is a no-op.
    store.stop().await;
}

#[tokio::test]
async fn registration_quota_tracks_insert_and_remove() {
    use mcp_oauth_gateway::models::{ClientType, RegisteredClient, TokenEndpointAuthMethod};

    let store = AuthStore::new(TokenCipher::disabled());
    let client = RegisteredClient {
        client_id: "c1".to_owned(),
        secret_hash: None,
        created_at: Utc::now(),
        redirect_uris: vec!["http://127.0.0.1/cb".to_owned()],
        auth_method: TokenEndpointAuthMethod::None,
        grant_types: vec!["authorization_code".to_owned()],
        response_types: vec!["code".to_owned()],
        client_name: None,
        scope: None,
        client_type: ClientType::Public,
        registered_from: Some("203.0.113.9".to_owned()),
    };
    store.insert_client(client).await;
    assert_eq!(store.registrations_from("203.0.113.9").await, 1);

    assert!(store.remove_client("c1").await);
    assert_eq!(store.registrations_from("203.0.113.9").await, 0);
    assert!(store.get_client("c1").await.is_none());
}
