// ABOUTME: SSO token-forwarding middleware for pre-validated upstream access tokens
// ABOUTME: Stores forwarded tokens by user email and injects them into the request
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # SSO access-token forwarding
//!
//! When an upstream aggregator has already validated the user's ID token, it
//! forwards the provider access token in `X-Google-Access-Token`, optionally
//! with `X-Google-Refresh-Token` and an RFC 3339 `X-Google-Token-Expiry`
//! (default one hour out). This middleware must run after bearer validation
//! so the authenticated user is available; requests without a user or
//! without the header pass through untouched.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use chrono::{DateTime, Duration, Utc};

use super::auth::RequestUser;
use crate::audit::{AuditEvent, AuditEventKind};
use crate::constants::{headers, lifetimes};
use crate::context::ServerContext;
use crate::models::UpstreamToken;

/// Outcome labels recorded for every pass through this middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ForwardOutcome {
    NoUser,
    NoToken,
    Stored,
    StoreFailed,
}

impl ForwardOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::NoUser => "no_user",
            Self::NoToken => "no_token",
            Self::Stored => "stored",
            Self::StoreFailed => "store_failed",
        }
    }
}

/// Accept a forwarded provider access token and store it for the
/// authenticated user.
pub async fn sso_access_token(
    State(ctx): State<Arc<ServerContext>>,
    mut request: Request,
    next: Next,
) -> Response {
    let outcome = ingest_forwarded_token(&ctx, &mut request).await;
    tracing::debug!(outcome = outcome.as_str(), "sso token forwarding");
    next.run(request).await
}

async fn ingest_forwarded_token(ctx: &ServerContext, request: &mut Request) -> ForwardOutcome {
    let Some(user) = request.extensions().get::<RequestUser>().cloned() else {
        return ForwardOutcome::NoUser;
    };

    let Some(access_token) = header_value(request, headers::SSO_ACCESS_TOKEN) else {
        return ForwardOutcome::NoToken;
    };
    tracing::debug!(outcome = "success", "forwarded token accepted for ingestion");

    let refresh_token = header_value(request, headers::SSO_REFRESH_TOKEN);
    let expires_at = header_value(request, headers::SSO_TOKEN_EXPIRY)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
        .map_or_else(
            || Utc::now() + Duration::seconds(lifetimes::FORWARDED_TOKEN_TTL_SECS),
            |parsed| parsed.with_timezone(&Utc),
        );

    let token = UpstreamToken {
        access_token: access_token.clone(),
        refresh_token,
        expires_at,
    };

    match ctx
        .store
        .save_upstream_token(&user.info.email, &token, None)
        .await
    {
        Ok(()) => {
            ctx.audit.log(
                &AuditEvent::new(AuditEventKind::SsoTokenStored).with_user(&user.info.email),
            );
            request.extensions_mut().insert(RequestUser {
                info: user.info,
                upstream_access_token: access_token,
            });
            ForwardOutcome::Stored
        }
        Err(error) => {
            tracing::warn!(error = %error, "failed to store forwarded token");
            ForwardOutcome::StoreFailed
        }
    }
}

fn header_value(request: &Request, name: &str) -> Option<String> {
    request
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}
