// ABOUTME: axum route handlers for the OAuth endpoints and discovery documents
// ABOUTME: Parses wire requests, invokes the engine, and shapes HTTP responses
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, Request as HttpRequest, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use base64::{engine::general_purpose, Engine as _};

use super::endpoints::{AuthorizationServer, BasicCredentials};
use super::models::{
    AuthorizationServerMetadata, AuthorizeRequest, ClientRegistrationRequest,
    ProtectedResourceMetadata, RevokeRequest, TokenRequest,
};
use super::registration::ClientRegistrar;
use crate::constants::headers as header_names;
use crate::context::ServerContext;
use crate::errors::OAuthError;
use crate::middleware::rate_limiting::ip_rate_limit;
use crate::ratelimit::client_ip;

/// Build the authorization server router. The per-IP rate limit wraps every
/// route as the outermost layer.
pub fn router(ctx: Arc<ServerContext>) -> Router {
    Router::new()
        .route(
            "/.well-known/oauth-authorization-server",
            get(authorization_server_metadata),
        )
        .route(
            "/.well-known/oauth-protected-resource",
            get(protected_resource_metadata),
        )
        .route("/oauth/register", post(handle_register))
        .route("/oauth/authorize", get(handle_authorize))
        .route("/oauth/callback", get(handle_callback))
        .route("/oauth/token", post(handle_token))
        .route("/oauth/revoke", post(handle_revoke))
        .route("/health", get(handle_health))
        .layer(axum::middleware::from_fn_with_state(
            ctx.clone(),
            ip_rate_limit,
        ))
        .with_state(ctx)
}

/// AS metadata (RFC 8414).
async fn authorization_server_metadata(
    State(ctx): State<Arc<ServerContext>>,
) -> Json<AuthorizationServerMetadata> {
    Json(AuthorizationServerMetadata::for_issuer(
        ctx.config.issuer(),
        &ctx.config.idp.scopes,
    ))
}

/// PR metadata (RFC 9728).
async fn protected_resource_metadata(
    State(ctx): State<Arc<ServerContext>>,
) -> Json<ProtectedResourceMetadata> {
    Json(ProtectedResourceMetadata::for_issuer(
        ctx.config.issuer(),
        &ctx.config.idp.scopes,
    ))
}

/// Liveness probe.
async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `POST /oauth/register` (RFC 7591).
async fn handle_register(
    State(ctx): State<Arc<ServerContext>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<ClientRegistrationRequest>,
) -> Response {
    let source_ip = request_ip(&ctx, connect_info, &headers);
    let registration_token = headers
        .get(header_names::REGISTRATION_ACCESS_TOKEN)
        .and_then(|v| v.to_str().ok());

    let registrar = ClientRegistrar::new(ctx.clone());
    match registrar
        .register(request, source_ip, registration_token)
        .await
    {
        Ok(response) => (StatusCode::CREATED, Json(response)).into_response(),
        Err(error) => {
            tracing::warn!(error = %error, "client registration rejected");
            error.into_response()
        }
    }
}

/// `GET /oauth/authorize`: start the delegated consent flow.
async fn handle_authorize(
    State(ctx): State<Arc<ServerContext>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let source_ip = request_ip(&ctx, connect_info, &headers);
    let request = match AuthorizeRequest::from_query(&params) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };

    let server = AuthorizationServer::new(ctx);
    match server.authorize(request, source_ip).await {
        Ok(location) => found(&location),
        Err(error) => error.into_response(),
    }
}

/// `GET /oauth/callback`: the provider redirect target.
async fn handle_callback(
    State(ctx): State<Arc<ServerContext>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let server = AuthorizationServer::new(ctx);
    match server.callback(&params).await {
        Ok(location) => found(&location),
        Err(error) => error.into_response(),
    }
}

/// `POST /oauth/token`: code exchange and refresh.
async fn handle_token(
    State(ctx): State<Arc<ServerContext>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let source_ip = request_ip(&ctx, connect_info, &headers);
    let basic = parse_basic_auth(&headers);
    let request = match TokenRequest::from_form(&form) {
        Ok(request) => request,
        Err(error) => return no_store(error.into_response()),
    };

    let grant_type = request.grant_type.clone();
    let server = AuthorizationServer::new(ctx);
    match server.token(request, basic, source_ip).await {
        Ok(response) => {
            tracing::info!(grant_type = %grant_type, "token request granted");
            no_store((StatusCode::OK, Json(response)).into_response())
        }
        Err(error) => {
            tracing::warn!(grant_type = %grant_type, error = %error, "token request failed");
            no_store(error.into_response())
        }
    }
}

/// `POST /oauth/revoke` (RFC 7009). Returns 200 with an empty body for every
/// authenticated outcome.
async fn handle_revoke(
    State(ctx): State<Arc<ServerContext>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let basic = parse_basic_auth(&headers);
    let request = match RevokeRequest::from_form(&form) {
        Ok(request) => request,
        Err(error) => return error.into_response(),
    };

    let server = AuthorizationServer::new(ctx);
    match server.revoke(request, basic).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => error.into_response(),
    }
}

/// Resolve the client IP for this request per the proxy-trust policy.
fn request_ip(
    ctx: &ServerContext,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: &HeaderMap,
) -> Option<IpAddr> {
    let peer = connect_info.map(|ConnectInfo(addr)| addr.ip());
    client_ip(peer, headers, ctx.config.trust_proxy)
}

/// Parse HTTP Basic credentials from the `Authorization` header.
fn parse_basic_auth(headers: &HeaderMap) -> Option<BasicCredentials> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    Some(BasicCredentials {
        username: username.to_owned(),
        password: password.to_owned(),
    })
}

/// 302 Found redirect; the OAuth flow requires 302 rather than 303/307.
fn found(location: &str) -> Response {
    let location_value = HeaderValue::from_str(location)
        .unwrap_or_else(|_| HeaderValue::from_static("/"));
    Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location_value)
        .body(Body::empty())
        .map_or_else(
            |_| OAuthError::server_error("Failed to build redirect").into_response(),
            |response| response,
        )
}

/// Token responses must never be cached.
fn no_store(mut response: Response) -> Response {
    let headers = response.headers_mut();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response
}

/// Shared helper for tests that need a request with a connected peer.
#[doc(hidden)]
pub fn attach_peer(request: &mut HttpRequest<Body>, addr: SocketAddr) {
    request.extensions_mut().insert(ConnectInfo(addr));
}
