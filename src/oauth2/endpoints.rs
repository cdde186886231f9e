// ABOUTME: OAuth 2.1 authorization engine: authorize, callback, token, revoke
// ABOUTME: Delegates consent upstream, enforces PKCE, rotates refresh tokens
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Authorization engine
//!
//! Endpoint semantics behind the HTTP layer. Every outbound provider call
//! happens with no store locks held: values are copied out of the store,
//! the call is made, and results are committed afterwards. Authorization
//! codes are redeemed with a single retrieve-and-delete, so replay under
//! concurrent redemption is impossible.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use chrono::{Duration, Utc};

use super::models::{AuthorizeRequest, RevokeRequest, TokenRequest, TokenResponse};
use crate::audit::{AuditEvent, AuditEventKind};
use crate::constants::{lifetimes, limits, tokens};
use crate::context::ServerContext;
use crate::crypto;
use crate::errors::OAuthError;
use crate::idp::{AuthUrlParams, UpstreamError};
use crate::models::{
    AuthorizationCode, ClientType, FlowState, PkceChallenge, PkceMethod, RefreshTokenRecord,
    RegisteredClient, UpstreamToken,
};
use crate::silent::is_silent_auth_error;

/// HTTP Basic credentials parsed from the `Authorization` header.
#[derive(Debug, Clone)]
pub struct BasicCredentials {
    /// Username; the client identifier.
    pub username: String,
    /// Password; the client secret.
    pub password: String,
}

/// The authorization engine.
pub struct AuthorizationServer {
    ctx: Arc<ServerContext>,
}

impl AuthorizationServer {
    /// Create the engine over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Handle `GET /oauth/authorize`: validate the request, persist flow
    /// state, and return the upstream authorization URL to redirect to.
    ///
    /// # Errors
    /// Returns an error when the client, redirect URI, state, PKCE, or scope
    /// validation fails. Errors are never relayed to an unvalidated redirect
    /// URI.
    pub async fn authorize(
        &self,
        request: AuthorizeRequest,
        source_ip: Option<IpAddr>,
    ) -> Result<String, OAuthError> {
        let client = self
            .ctx
            .store
            .get_client(&request.client_id)
            .await
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

        if !client.redirect_uris.contains(&request.redirect_uri) {
            return Err(OAuthError::invalid_redirect_uri(
                "redirect_uri is not registered for this client",
            ));
        }

        if let Some(response_type) = request.response_type.as_deref() {
            if response_type != "code" {
                return Err(OAuthError::invalid_request(
                    "Only the 'code' response_type is supported",
                ));
            }
        }

        if request.state.is_none() {
            if self.ctx.config.allow_insecure_auth_without_state {
                tracing::warn!(
                    client_id = %request.client_id,
                    "authorization request without state accepted by configuration"
                );
            } else {
                return Err(OAuthError::invalid_request(
                    "The state parameter is required",
                ));
            }
        }

        let pkce = self.validate_authorize_pkce(&request, &client)?;
        let scope = self.resolve_scope(request.scope.as_deref(), &client)?;

        let upstream_state = crypto::generate_token(tokens::STATE_BYTES)
            .map_err(|_| OAuthError::server_error("Failed to generate state token"))?;

        let now = Utc::now();
        let flow = FlowState {
            client_state: request.state.clone(),
            client_id: request.client_id.clone(),
            redirect_uri: request.redirect_uri.clone(),
            scope: scope.clone(),
            pkce,
            nonce: request.nonce.clone(),
            prompt: request.prompt.clone(),
            created_at: now,
            expires_at: now + Duration::seconds(lifetimes::FLOW_STATE_TTL_SECS),
        };
        self.ctx
            .store
            .put_flow_state(upstream_state.clone(), flow)
            .await;

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::AuthorizationStarted)
                .with_client(request.client_id.clone())
                .with_source_ip(
                    source_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string()),
                ),
        );

        let callback_url = self.ctx.config.callback_url();
        Ok(self.ctx.idp.authorization_url(&AuthUrlParams {
            redirect_uri: &callback_url,
            state: &upstream_state,
            scope: &scope,
            nonce: request.nonce.as_deref(),
            prompt: request.prompt.as_deref(),
        }))
    }

    /// Handle `GET /oauth/callback`: consume the flow state, exchange the
    /// provider code, mint a server authorization code, and return the
    /// redirect back to the client.
    ///
    /// Provider errors are relayed to the client's registered redirect URI;
    /// the four silent-authentication codes pass through verbatim, everything
    /// else maps to `access_denied`.
    ///
    /// # Errors
    /// Returns an error when the state is unknown or expired (no redirect
    /// target can be trusted) or when the upstream exchange fails.
    pub async fn callback(
        &self,
        params: &HashMap<String, String>,
    ) -> Result<String, OAuthError> {
        let state = params
            .get("state")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing state parameter"))?;

        let flow = self
            .ctx
            .store
            .take_flow_state(state)
            .await
            .ok_or_else(|| OAuthError::invalid_request("Unknown or expired state"))?;

        if let Some(error) = params.get("error") {
            return Ok(self.relay_provider_error(&flow, error, params.get("error_description")));
        }

        let code = params
            .get("code")
            .filter(|c| !c.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing code parameter"))?;

        // Flow state is already consumed; no locks are held across the
        // provider calls below.
        let callback_url = self.ctx.config.callback_url();
        let upstream = self
            .ctx
            .idp
            .exchange_code(code, &callback_url)
            .await
            .map_err(|e| {
                self.ctx.audit.log(
                    &AuditEvent::new(AuditEventKind::AuthorizationFailed)
                        .with_client(flow.client_id.clone())
                        .failed(e.to_string()),
                );
                upstream_to_oauth(&e)
            })?;

        let user = self
            .ctx
            .idp
            .userinfo(&upstream.access_token)
            .await
            .map_err(|e| {
                self.ctx.audit.log(
                    &AuditEvent::new(AuditEventKind::AuthorizationFailed)
                        .with_client(flow.client_id.clone())
                        .failed(e.to_string()),
                );
                upstream_to_oauth(&e)
            })?;
        self.ctx.store.cache_user_info(user.clone());

        let code_value = crypto::generate_token(tokens::AUTH_CODE_BYTES)
            .map_err(|_| OAuthError::server_error("Failed to generate authorization code"))?;

        let now = Utc::now();
        let record = AuthorizationCode {
            client_id: flow.client_id.clone(),
            redirect_uri: flow.redirect_uri.clone(),
            scope: flow.scope.clone(),
            pkce: flow.pkce.clone(),
            upstream,
            user_email: user.email.clone(),
            created_at: now,
            expires_at: now + Duration::seconds(lifetimes::AUTH_CODE_TTL_SECS),
        };
        self.ctx
            .store
            .put_auth_code(code_value.clone(), record)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to store authorization code");
                OAuthError::server_error("Failed to store authorization code")
            })?;

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::AuthorizationCompleted)
                .with_user(&user.email)
                .with_client(flow.client_id.clone()),
        );

        let mut pairs = vec![("code", code_value)];
        if let Some(client_state) = &flow.client_state {
            pairs.push(("state", client_state.clone()));
        }
        Ok(append_query(&flow.redirect_uri, &pairs))
    }

    /// Handle `POST /oauth/token`.
    ///
    /// # Errors
    /// Returns the OAuth error for the failing validation step.
    pub async fn token(
        &self,
        request: TokenRequest,
        basic: Option<BasicCredentials>,
        source_ip: Option<IpAddr>,
    ) -> Result<TokenResponse, OAuthError> {
        match request.grant_type.as_str() {
            "authorization_code" => self.authorization_code_grant(request, basic, source_ip).await,
            "refresh_token" => self.refresh_token_grant(request, source_ip).await,
            _ => Err(OAuthError::unsupported_grant_type()),
        }
    }

    async fn authorization_code_grant(
        &self,
        request: TokenRequest,
        basic: Option<BasicCredentials>,
        source_ip: Option<IpAddr>,
    ) -> Result<TokenResponse, OAuthError> {
        let code = request
            .code
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing code parameter"))?;

        // Single-use: the code is gone after this call no matter how the
        // rest of the exchange goes.
        let record = self
            .ctx
            .store
            .take_auth_code(code)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to read authorization code");
                OAuthError::server_error("Failed to read authorization code")
            })?
            .ok_or_else(|| OAuthError::invalid_grant("Invalid or expired authorization code"))?;

        let presented_client_id = request
            .client_id
            .as_deref()
            .or(basic.as_ref().map(|b| b.username.as_str()));
        if let Some(presented) = presented_client_id {
            if presented != record.client_id {
                return Err(OAuthError::invalid_grant(
                    "The authorization code was issued to another client",
                ));
            }
        }

        let client = self
            .ctx
            .store
            .get_client(&record.client_id)
            .await
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

        match request.redirect_uri.as_deref() {
            Some(uri) if uri == record.redirect_uri => {}
            _ => {
                return Err(OAuthError::invalid_grant(
                    "redirect_uri does not match the authorization request",
                ));
            }
        }

        // PKCE and client authentication both precede any store mutation.
        if let Some(pkce) = &record.pkce {
            verify_pkce(pkce, request.code_verifier.as_deref())?;
        } else if request.code_verifier.is_some() {
            return Err(OAuthError::invalid_grant(
                "code_verifier provided but no code_challenge was issued",
            ));
        }

        self.authenticate_client(&client, request.client_secret.as_deref(), basic.as_ref())
            .await?;

        let upstream = self
            .ensure_fresh_for_exchange(record.upstream, &record.user_email)
            .await?;

        let access_token = crypto::generate_token(tokens::ACCESS_TOKEN_BYTES)
            .map_err(|_| OAuthError::server_error("Failed to generate access token"))?;
        let access_expires_at = Utc::now() + Duration::seconds(lifetimes::ACCESS_TOKEN_TTL_SECS);

        self.ctx
            .store
            .save_upstream_token(
                &record.user_email,
                &upstream,
                Some((&access_token, access_expires_at)),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to store upstream token");
                OAuthError::server_error("Failed to store token")
            })?;

        let refresh_token = if client.grant_types.iter().any(|g| g == "refresh_token") {
            let token = crypto::generate_token(tokens::REFRESH_TOKEN_BYTES)
                .map_err(|_| OAuthError::server_error("Failed to generate refresh token"))?;
            self.ctx
                .store
                .put_refresh_token(
                    token.clone(),
                    RefreshTokenRecord {
                        user_email: record.user_email.clone(),
                        expires_at: Utc::now()
                            + Duration::days(self.ctx.config.refresh_token_ttl_days),
                    },
                )
                .await;
            Some(token)
        } else {
            None
        };

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::CodeExchanged)
                .with_user(&record.user_email)
                .with_client(record.client_id.clone())
                .with_source_ip(
                    source_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string()),
                ),
        );

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: lifetimes::ACCESS_TOKEN_TTL_SECS,
            refresh_token,
            scope: Some(record.scope),
        })
    }

    async fn refresh_token_grant(
        &self,
        request: TokenRequest,
        source_ip: Option<IpAddr>,
    ) -> Result<TokenResponse, OAuthError> {
        let presented = request
            .refresh_token
            .as_deref()
            .ok_or_else(|| OAuthError::invalid_request("Missing refresh_token parameter"))?;

        // A rotated token showing up again is compromise evidence: revoke
        // everything the user holds and fail the request.
        if let Some(user_email) = self.ctx.store.rotated_owner(presented).await {
            let revoked = self.ctx.store.revoke_refresh_tokens_for(&user_email).await;
            self.ctx.audit.log(
                &AuditEvent::new(AuditEventKind::TokenReuseDetected)
                    .high_severity()
                    .with_user(&user_email)
                    .with_source_ip(
                        source_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string()),
                    )
                    .failed("rotated refresh token presented again")
                    .with_metadata(serde_json::json!({ "revoked_tokens": revoked })),
            );
            return Err(OAuthError::invalid_grant(
                "Refresh token reuse detected; all sessions for this user were revoked",
            ));
        }

        let record = self
            .ctx
            .store
            .get_refresh_token(presented)
            .await
            .ok_or_else(|| OAuthError::invalid_grant("Unknown or expired refresh token"))?;

        let upstream = self
            .ctx
            .store
            .get_upstream_by_email(&record.user_email)
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to read upstream token");
                OAuthError::server_error("Failed to read token")
            })?
            .ok_or_else(|| {
                OAuthError::invalid_grant("No upstream session for this user; re-authenticate")
            })?;

        let Some(upstream_refresh) = upstream.refresh_token.clone() else {
            return Err(OAuthError::invalid_grant(
                "The upstream session cannot be refreshed; re-authenticate",
            ));
        };

        // No locks held across the provider call.
        let refreshed = self.ctx.idp.refresh(&upstream_refresh).await.map_err(|e| {
            self.ctx.audit.log(
                &AuditEvent::new(AuditEventKind::UpstreamRefreshFailed)
                    .with_user(&record.user_email)
                    .failed(e.to_string()),
            );
            OAuthError::invalid_grant("Upstream refresh failed; re-authenticate")
        })?;

        let access_token = crypto::generate_token(tokens::ACCESS_TOKEN_BYTES)
            .map_err(|_| OAuthError::server_error("Failed to generate access token"))?;
        let access_expires_at = Utc::now() + Duration::seconds(lifetimes::ACCESS_TOKEN_TTL_SECS);

        self.ctx
            .store
            .save_upstream_token(
                &record.user_email,
                &refreshed,
                Some((&access_token, access_expires_at)),
            )
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "failed to store refreshed token");
                OAuthError::server_error("Failed to store token")
            })?;

        let returned_refresh = if self.ctx.config.rotate_refresh_tokens {
            let rotated = crypto::generate_token(tokens::REFRESH_TOKEN_BYTES)
                .map_err(|_| OAuthError::server_error("Failed to generate refresh token"))?;
            self.ctx
                .store
                .rotate_refresh_token(
                    presented,
                    rotated.clone(),
                    RefreshTokenRecord {
                        user_email: record.user_email.clone(),
                        expires_at: Utc::now()
                            + Duration::days(self.ctx.config.refresh_token_ttl_days),
                    },
                )
                .await;
            rotated
        } else {
            presented.to_owned()
        };

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::TokenRefreshed)
                .with_user(&record.user_email)
                .with_source_ip(
                    source_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string()),
                ),
        );

        Ok(TokenResponse {
            access_token,
            token_type: "Bearer".to_owned(),
            expires_in: lifetimes::ACCESS_TOKEN_TTL_SECS,
            refresh_token: Some(returned_refresh),
            scope: None,
        })
    }

    /// Handle `POST /oauth/revoke` (RFC 7009). The outcome is always 200 for
    /// authenticated clients; unknown or already-revoked tokens only log.
    ///
    /// # Errors
    /// Returns an error only for client authentication failures or a missing
    /// token parameter.
    pub async fn revoke(
        &self,
        request: RevokeRequest,
        basic: Option<BasicCredentials>,
    ) -> Result<(), OAuthError> {
        let client_id = request
            .client_id
            .as_deref()
            .or(basic.as_ref().map(|b| b.username.as_str()))
            .ok_or_else(|| OAuthError::invalid_client("Client authentication required"))?;

        let client = self
            .ctx
            .store
            .get_client(client_id)
            .await
            .ok_or_else(|| OAuthError::invalid_client("Unknown client"))?;

        self.authenticate_client(&client, request.client_secret.as_deref(), basic.as_ref())
            .await?;

        let hint = request.token_type_hint.as_deref();
        let removed = match hint {
            Some("refresh_token") => {
                self.ctx.store.remove_refresh_token(&request.token).await
                    || self.ctx.store.remove_bearer(&request.token).await
            }
            Some("access_token") => {
                self.ctx.store.remove_bearer(&request.token).await
                    || self.ctx.store.remove_refresh_token(&request.token).await
            }
            _ => {
                self.ctx.store.remove_refresh_token(&request.token).await
                    || self.ctx.store.remove_bearer(&request.token).await
            }
        };

        if removed {
            self.ctx.audit.log(
                &AuditEvent::new(AuditEventKind::TokenRevoked).with_client(client_id.to_owned()),
            );
        } else {
            tracing::debug!(client_id, "revocation for unknown token");
        }
        Ok(())
    }

    fn validate_authorize_pkce(
        &self,
        request: &AuthorizeRequest,
        client: &RegisteredClient,
    ) -> Result<Option<PkceChallenge>, OAuthError> {
        let Some(challenge) = request.code_challenge.as_deref() else {
            if client.client_type == ClientType::Public {
                return Err(OAuthError::invalid_request(
                    "code_challenge is required for public clients (PKCE)",
                ));
            }
            return Ok(None);
        };

        if challenge.len() < limits::PKCE_VERIFIER_MIN_LEN
            || challenge.len() > limits::PKCE_VERIFIER_MAX_LEN
        {
            return Err(OAuthError::invalid_request(
                "code_challenge must be between 43 and 128 characters",
            ));
        }

        let method = PkceMethod::from_wire(request.code_challenge_method.as_deref())
            .ok_or_else(|| {
                OAuthError::invalid_request("code_challenge_method must be 'S256' or 'plain'")
            })?;
        if method == PkceMethod::Plain && !self.ctx.config.allow_plain_pkce {
            return Err(OAuthError::invalid_request(
                "The 'plain' code_challenge_method is not allowed",
            ));
        }

        Ok(Some(PkceChallenge {
            challenge: challenge.to_owned(),
            method,
        }))
    }

    fn resolve_scope(
        &self,
        requested: Option<&str>,
        client: &RegisteredClient,
    ) -> Result<String, OAuthError> {
        let supported = &self.ctx.config.idp.scopes;
        let requested = requested
            .map(str::to_owned)
            .or_else(|| client.scope.clone())
            .unwrap_or_else(|| supported.join(" "));

        for scope in requested.split_whitespace() {
            if !supported.iter().any(|s| s == scope) {
                return Err(OAuthError::invalid_scope(&format!(
                    "Scope {scope:?} is not supported"
                )));
            }
        }
        Ok(requested)
    }

    async fn authenticate_client(
        &self,
        client: &RegisteredClient,
        body_secret: Option<&str>,
        basic: Option<&BasicCredentials>,
    ) -> Result<(), OAuthError> {
        if !client.auth_method.requires_secret() {
            return Ok(());
        }

        let secret = match basic {
            Some(creds) if creds.username == client.client_id => Some(creds.password.as_str()),
            _ => body_secret,
        };
        let Some(secret) = secret else {
            return Err(OAuthError::invalid_client("Client authentication required"));
        };
        let Some(hash) = client.secret_hash.as_deref() else {
            return Err(OAuthError::invalid_client("Client has no registered secret"));
        };

        if crypto::verify_secret(secret, hash).await {
            Ok(())
        } else {
            tracing::warn!(client_id = %client.client_id, "client secret validation failed");
            Err(OAuthError::invalid_client("Client authentication failed"))
        }
    }

    /// Refresh the upstream token bound to an authorization code when its
    /// remaining lifetime is below the exchange skew.
    async fn ensure_fresh_for_exchange(
        &self,
        upstream: UpstreamToken,
        user_email: &str,
    ) -> Result<UpstreamToken, OAuthError> {
        if !upstream.needs_exchange_refresh() {
            return Ok(upstream);
        }

        let Some(refresh) = upstream.refresh_token.clone() else {
            return Err(OAuthError::invalid_grant(
                "The upstream session expired and cannot be refreshed; re-authenticate",
            ));
        };

        match self.ctx.idp.refresh(&refresh).await {
            Ok(refreshed) => Ok(refreshed),
            Err(e) => {
                self.ctx.audit.log(
                    &AuditEvent::new(AuditEventKind::UpstreamRefreshFailed)
                        .with_user(user_email)
                        .failed(e.to_string()),
                );
                Err(OAuthError::invalid_grant(
                    "The upstream session expired; re-authenticate",
                ))
            }
        }
    }

    fn relay_provider_error(
        &self,
        flow: &FlowState,
        error: &str,
        description: Option<&String>,
    ) -> String {
        let (relayed, relayed_description) = if is_silent_auth_error(error) {
            (
                error.to_owned(),
                description.cloned().unwrap_or_else(|| {
                    "User interaction is required to complete authentication".to_owned()
                }),
            )
        } else {
            (
                "access_denied".to_owned(),
                description
                    .cloned()
                    .unwrap_or_else(|| "The authorization request was denied upstream".to_owned()),
            )
        };

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::AuthorizationFailed)
                .with_client(flow.client_id.clone())
                .failed(format!("provider returned {error}")),
        );

        let mut pairs = vec![
            ("error", relayed),
            ("error_description", relayed_description),
        ];
        if let Some(state) = &flow.client_state {
            pairs.push(("state", state.clone()));
        }
        append_query(&flow.redirect_uri, &pairs)
    }
}

/// Map an upstream failure during the callback exchange to the response the
/// client sees. Transient provider problems are `temporarily_unavailable`;
/// everything else is a `server_error`.
fn upstream_to_oauth(error: &UpstreamError) -> OAuthError {
    match error {
        UpstreamError::RateLimited
        | UpstreamError::Unavailable(_)
        | UpstreamError::Network(_) => OAuthError::temporarily_unavailable(error.user_message()),
        UpstreamError::Unauthorized(_) | UpstreamError::Protocol(_) => {
            OAuthError::server_error("The identity provider rejected the exchange")
        }
    }
}

/// Verify a PKCE code verifier against its stored challenge. Length and
/// charset violations are `invalid_request`; only the final comparison
/// mismatch is `invalid_grant`.
fn verify_pkce(pkce: &PkceChallenge, verifier: Option<&str>) -> Result<(), OAuthError> {
    let verifier =
        verifier.ok_or_else(|| OAuthError::invalid_request("code_verifier is required (PKCE)"))?;

    if verifier.len() < limits::PKCE_VERIFIER_MIN_LEN
        || verifier.len() > limits::PKCE_VERIFIER_MAX_LEN
    {
        return Err(OAuthError::invalid_request(
            "code_verifier must be between 43 and 128 characters",
        ));
    }

    if !verifier
        .chars()
        .all(|c| matches!(c, 'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '.' | '_' | '~'))
    {
        return Err(OAuthError::invalid_request(
            "code_verifier contains characters outside the unreserved set",
        ));
    }

    let matches = match pkce.method {
        PkceMethod::S256 => {
            let computed = crypto::s256_challenge(verifier);
            crypto::constant_time_eq(&computed, &pkce.challenge)
        }
        PkceMethod::Plain => crypto::constant_time_eq(verifier, &pkce.challenge),
    };

    if matches {
        Ok(())
    } else {
        Err(OAuthError::invalid_grant("Invalid code_verifier"))
    }
}

/// Append query pairs to a URL that may already carry a query string.
fn append_query(url: &str, pairs: &[(&str, String)]) -> String {
    use std::fmt::Write;
    let mut out = url.to_owned();
    let mut separator = if url.contains('?') { '&' } else { '?' };
    for (key, value) in pairs {
        write!(&mut out, "{separator}{key}={}", urlencoding::encode(value)).ok();
        separator = '&';
    }
    out
}
