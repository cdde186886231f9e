// ABOUTME: Per-IP rate limiting middleware applied as the outermost request layer
// ABOUTME: Charges the TCP peer unless a trusted proxy supplies the client address
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::audit::{AuditEvent, AuditEventKind};
use crate::context::ServerContext;
use crate::errors::OAuthError;
use crate::ratelimit::client_ip;

/// Outermost per-IP token bucket. Disabled layers pass through untouched.
/// Over-limit requests get `429` with `Retry-After: 1`.
pub async fn ip_rate_limit(
    State(ctx): State<Arc<ServerContext>>,
    request: Request,
    next: Next,
) -> Response {
    if !ctx.ip_limiter.is_enabled() {
        return next.run(request).await;
    }

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let key = client_ip(peer, request.headers(), ctx.config.trust_proxy)
        .map_or_else(|| "unknown".to_owned(), |ip| ip.to_string());

    if ctx.ip_limiter.allow(&key) {
        return next.run(request).await;
    }

    ctx.audit.log(
        &AuditEvent::new(AuditEventKind::RateLimited)
            .with_source_ip(key)
            .failed("per-IP rate limit exceeded"),
    );
    OAuthError::rate_limit_exceeded().into_response()
}
