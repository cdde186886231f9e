// ABOUTME: Upstream identity provider client for delegation, exchange, refresh, userinfo
// ABOUTME: Defines the provider trait and the Google-shaped HTTP implementation
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Identity provider integration
//!
//! The gateway consumes exactly three upstream endpoints: the authorization
//! URL it redirects resource owners to, the token endpoint for code exchange
//! and refresh (HTTP Basic with the provider credentials), and the userinfo
//! endpoint for bearer validation. Everything goes through the
//! [`IdentityProvider`] trait so tests can substitute a mock.

use std::time::Duration as StdDuration;

use anyhow::Result;
use chrono::{Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::config::IdpConfig;
use crate::constants::upstream_http;
use crate::models::{UpstreamToken, UserInfo};

/// Classified upstream failure.
#[derive(Debug, Clone, Error)]
pub enum UpstreamError {
    /// The provider rejected the credentials (401/403).
    #[error("upstream rejected the credentials: {0}")]
    Unauthorized(String),
    /// The provider rate limited the request (429).
    #[error("upstream rate limited the request")]
    RateLimited,
    /// The provider returned a 5xx.
    #[error("upstream temporarily unavailable: {0}")]
    Unavailable(String),
    /// The request never completed (DNS, connect, timeout).
    #[error("network error reaching the identity provider: {0}")]
    Network(String),
    /// The response did not match the expected shape.
    #[error("unexpected response from the identity provider: {0}")]
    Protocol(String),
}

impl UpstreamError {
    /// User-actionable message for bearer validation failures.
    #[must_use]
    pub const fn user_message(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => {
                "The token was rejected by the identity provider; it may be expired or revoked. Re-authenticate to continue."
            }
            Self::RateLimited => {
                "The identity provider is rate limiting requests; retry in a moment."
            }
            Self::Unavailable(_) => {
                "The identity provider is temporarily unavailable; retry in a moment."
            }
            Self::Network(_) => {
                "Could not reach the identity provider; check connectivity and retry."
            }
            Self::Protocol(_) => "The identity provider returned an unexpected response.",
        }
    }

    /// Whether the failure means the presented token is bad (as opposed to a
    /// transient provider problem).
    #[must_use]
    pub const fn is_credential_failure(&self) -> bool {
        matches!(self, Self::Unauthorized(_))
    }
}

/// Parameters for building the upstream authorization URL.
#[derive(Debug, Clone)]
pub struct AuthUrlParams<'a> {
    /// Callback URL on this gateway.
    pub redirect_uri: &'a str,
    /// Upstream state token binding the callback to the flow.
    pub state: &'a str,
    /// Space-separated scope string.
    pub scope: &'a str,
    /// OIDC nonce, when the client supplied one.
    pub nonce: Option<&'a str>,
    /// Prompt override; `None` requests consent so a refresh token is granted.
    pub prompt: Option<&'a str>,
}

/// The three upstream operations the gateway performs.
#[async_trait::async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Build the authorization URL the resource owner is redirected to.
    fn authorization_url(&self, params: &AuthUrlParams<'_>) -> String;

    /// Exchange an authorization code for a token triple.
    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamToken, UpstreamError>;

    /// Refresh an access token. Providers that do not rotate refresh tokens
    /// return the presented one.
    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken, UpstreamError>;

    /// Fetch user info with a bearer access token.
    async fn userinfo(&self, access_token: &str) -> Result<UserInfo, UpstreamError>;
}

/// Token endpoint response shape shared by Google-style providers.
#[derive(Debug, Deserialize)]
struct ProviderTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
}

/// Google-shaped identity provider backed by one pooled HTTP client.
pub struct GoogleProvider {
    client_id: String,
    client_secret: String,
    auth_url: String,
    token_url: String,
    userinfo_url: String,
    http: reqwest::Client,
}

impl GoogleProvider {
    /// Build a provider from configuration.
    ///
    /// # Errors
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(config: &IdpConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(upstream_http::TIMEOUT_SECS))
            .pool_max_idle_per_host(upstream_http::POOL_MAX_IDLE_PER_HOST)
            .tcp_keepalive(StdDuration::from_secs(60))
            .build()?;

        Ok(Self {
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            auth_url: config.auth_url.clone(),
            token_url: config.token_url.clone(),
            userinfo_url: config.userinfo_url.clone(),
            http,
        })
    }

    fn classify(status: reqwest::StatusCode, body: &str) -> UpstreamError {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            UpstreamError::Unauthorized(truncate(body, 200))
        } else if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            UpstreamError::RateLimited
        } else if status.is_server_error() {
            UpstreamError::Unavailable(status.to_string())
        } else {
            UpstreamError::Protocol(format!("{status}: {}", truncate(body, 200)))
        }
    }

    async fn token_request(
        &self,
        params: &[(&str, &str)],
    ) -> Result<UpstreamToken, UpstreamError> {
        let response = self
            .http
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(params)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify(status, &body));
        }

        let token: ProviderTokenResponse = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Protocol(format!("token response parse error: {e}")))?;

        let expires_in = token.expires_in.unwrap_or(3600);
        Ok(UpstreamToken {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            expires_at: Utc::now() + Duration::seconds(expires_in),
        })
    }
}

#[async_trait::async_trait]
impl IdentityProvider for GoogleProvider {
    fn authorization_url(&self, params: &AuthUrlParams<'_>) -> String {
        // access_type=offline plus a consent prompt makes the provider return
        // a refresh token on first grant.
        let mut url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}&access_type=offline&prompt={}",
            self.auth_url,
            urlencoding::encode(&self.client_id),
            urlencoding::encode(params.redirect_uri),
            urlencoding::encode(params.scope),
            urlencoding::encode(params.state),
            urlencoding::encode(params.prompt.unwrap_or("consent")),
        );
        if let Some(nonce) = params.nonce {
            use std::fmt::Write;
            write!(&mut url, "&nonce={}", urlencoding::encode(nonce)).ok();
        }
        url
    }

    async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
    ) -> Result<UpstreamToken, UpstreamError> {
        self.token_request(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ])
        .await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<UpstreamToken, UpstreamError> {
        let mut token = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;

        // Google omits the refresh token on refresh; keep the presented one.
        if token.refresh_token.is_none() {
            token.refresh_token = Some(refresh_token.to_owned());
        }
        Ok(token)
    }

    async fn userinfo(&self, access_token: &str) -> Result<UserInfo, UpstreamError> {
        let response = self
            .http
            .get(&self.userinfo_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| UpstreamError::Network(e.to_string()))?;

        if !status.is_success() {
            return Err(Self::classify(status, &body));
        }

        let info: UserInfo = serde_json::from_str(&body)
            .map_err(|e| UpstreamError::Protocol(format!("userinfo parse error: {e}")))?;
        if info.email.is_empty() {
            return Err(UpstreamError::Protocol(
                "userinfo response is missing an email".to_owned(),
            ));
        }
        Ok(info)
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
