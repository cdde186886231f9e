// ABOUTME: Bearer validation middleware resolving server tokens to upstream identities
// ABOUTME: Refreshes expiring upstream tokens proactively and injects the request user
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Bearer validation middleware
//!
//! Pipeline per request: extract the bearer, resolve it to a stored upstream
//! token (falling back to treating the bearer as a provider token directly),
//! validate it against the provider's userinfo endpoint, apply the per-user
//! rate limit, refresh the upstream token when it is close to expiry, and
//! inject the authenticated user into request extensions before invoking the
//! wrapped handler.
//!
//! The optional variant passes requests without an `Authorization` header
//! through untouched.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};

use crate::constants::lifetimes;
use crate::context::ServerContext;
use crate::errors::{ErrorEnvelope, OAuthError};
use crate::idp::UpstreamError;
use crate::models::{UpstreamToken, UserInfo};

/// The authenticated user injected into request extensions.
#[derive(Debug, Clone)]
pub struct RequestUser {
    /// Identity from the provider's userinfo endpoint.
    pub info: UserInfo,
    /// Upstream access token to call provider APIs with.
    pub upstream_access_token: String,
}

/// Require a valid bearer token; reject the request otherwise.
pub async fn require_bearer(
    State(ctx): State<Arc<ServerContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    match authenticate(&ctx, &mut request).await {
        Ok(()) => next.run(request).await,
        Err(response) => response,
    }
}

/// Validate the bearer when present; pass through anonymous requests.
pub async fn optional_bearer(
    State(ctx): State<Arc<ServerContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    if request.headers().get(header::AUTHORIZATION).is_none() {
        return next.run(request).await;
    }
    match authenticate(&ctx, &mut request).await {
        Ok(()) => next.run(request).await,
        Err(response) => response,
    }
}

async fn authenticate(ctx: &ServerContext, request: &mut Request) -> Result<(), Response> {
    let bearer = extract_bearer(ctx, request)?;

    let resolved = ctx.store.resolve_bearer(&bearer).await.map_err(|e| {
        tracing::error!(error = %e, "bearer resolution failed");
        OAuthError::server_error("Failed to resolve token").into_response()
    })?;

    // Fallback: an unknown bearer may be a provider token presented
    // directly by a legacy client.
    let (mut upstream, bearer_expires_at, server_issued) = match resolved {
        Some(resolved) => (resolved.upstream, resolved.expires_at, true),
        None => (
            UpstreamToken {
                access_token: bearer.clone(),
                refresh_token: None,
                expires_at: Utc::now()
                    + Duration::seconds(lifetimes::FORWARDED_TOKEN_TTL_SECS),
            },
            Utc::now() + Duration::seconds(lifetimes::ACCESS_TOKEN_TTL_SECS),
            false,
        ),
    };

    let info = match ctx.idp.userinfo(&upstream.access_token).await {
        Ok(info) => info,
        Err(error) => return Err(upstream_failure_response(ctx, &error, server_issued)),
    };
    let user_email = info.email.clone();

    if ctx.user_limiter.is_enabled() && !ctx.user_limiter.allow(&user_email) {
        let mut response = OAuthError::rate_limit_exceeded().into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        return Err(response);
    }

    // Proactive refresh: a failure here is logged but never fails an
    // otherwise-valid request.
    if upstream.expires_within(Duration::seconds(
        lifetimes::MIDDLEWARE_REFRESH_THRESHOLD_SECS,
    )) {
        if let Some(refresh_token) = upstream.refresh_token.clone() {
            match ctx.idp.refresh(&refresh_token).await {
                Ok(refreshed) => upstream = refreshed,
                Err(error) => {
                    tracing::warn!(
                        error = %error,
                        "proactive upstream refresh failed; continuing with current token"
                    );
                }
            }
        }
    }

    if let Err(error) = ctx
        .store
        .save_upstream_token(&user_email, &upstream, Some((&bearer, bearer_expires_at)))
        .await
    {
        tracing::warn!(error = %error, "failed to re-save upstream token");
    }
    ctx.store.cache_user_info(info.clone());

    request.extensions_mut().insert(RequestUser {
        info,
        upstream_access_token: upstream.access_token,
    });
    Ok(())
}

fn extract_bearer(ctx: &ServerContext, request: &Request) -> Result<String, Response> {
    let Some(value) = request.headers().get(header::AUTHORIZATION) else {
        return Err(challenge(ctx, "Authorization header is required"));
    };
    let Ok(value) = value.to_str() else {
        return Err(challenge(ctx, "Authorization header is not valid UTF-8"));
    };
    let Some(token) = value.strip_prefix("Bearer ") else {
        return Err(challenge(ctx, "Authorization header must use the Bearer scheme"));
    };
    if token.is_empty() {
        return Err(challenge(ctx, "Bearer token is empty"));
    }
    Ok(token.to_owned())
}

/// 401 with the discovery challenge pointing clients at the protected
/// resource metadata.
fn challenge(ctx: &ServerContext, description: &str) -> Response {
    let error = OAuthError::invalid_token(description);
    let envelope = ErrorEnvelope::from(&error);
    let header_value = format!(
        "Bearer realm=\"{}\", resource_metadata=\"{}\"",
        ctx.config.issuer(),
        ctx.config.resource_metadata_url()
    );
    let mut response = (StatusCode::UNAUTHORIZED, Json(envelope)).into_response();
    if let Ok(value) = HeaderValue::from_str(&header_value) {
        response
            .headers_mut()
            .insert(header::WWW_AUTHENTICATE, value);
    }
    response
}

fn upstream_failure_response(
    ctx: &ServerContext,
    error: &UpstreamError,
    server_issued: bool,
) -> Response {
    if error.is_credential_failure() {
        if server_issued {
            tracing::info!("stored upstream token rejected by the provider");
        }
        return challenge(ctx, error.user_message());
    }
    match error {
        UpstreamError::RateLimited
        | UpstreamError::Unavailable(_)
        | UpstreamError::Network(_) => {
            OAuthError::temporarily_unavailable(error.user_message()).into_response()
        }
        _ => OAuthError::server_error(error.user_message()).into_response(),
    }
}
