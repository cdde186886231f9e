// ABOUTME: OAuth 2.0 error taxonomy with HTTP status mapping and JSON envelope
// ABOUTME: Defines the tagged error type returned by every endpoint and middleware
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Unified OAuth error handling
//!
//! Every policy or validation failure in the authorization engine is expressed
//! as an [`OAuthError`] carrying an RFC 6749 error code, an optional
//! human-readable description, and the HTTP status implied by the code. The
//! axum boundary converts the error into the standard JSON envelope
//! `{error, error_description?, error_uri?}`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// OAuth error codes used throughout the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    /// The request is missing a parameter or is otherwise malformed.
    InvalidRequest,
    /// The authorization code, refresh token, or PKCE proof is invalid.
    InvalidGrant,
    /// Client authentication failed.
    InvalidClient,
    /// The requested scope exceeds what the server supports.
    InvalidScope,
    /// The presented bearer token is invalid or expired.
    InvalidToken,
    /// The client is not authorized to use this grant or response type.
    UnauthorizedClient,
    /// The grant type is not supported by the token endpoint.
    UnsupportedGrantType,
    /// The redirect URI failed the security policy.
    InvalidRedirectUri,
    /// The resource owner or upstream provider denied the request.
    AccessDenied,
    /// An internal failure prevented the request from completing.
    ServerError,
    /// The upstream provider is temporarily unavailable.
    TemporarilyUnavailable,
    /// A rate limit was exceeded.
    RateLimitExceeded,
}

impl OAuthErrorCode {
    /// Wire name of the error code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidClient => "invalid_client",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidToken => "invalid_token",
            Self::UnauthorizedClient => "unauthorized_client",
            Self::UnsupportedGrantType => "unsupported_grant_type",
            Self::InvalidRedirectUri => "invalid_redirect_uri",
            Self::AccessDenied => "access_denied",
            Self::ServerError => "server_error",
            Self::TemporarilyUnavailable => "temporarily_unavailable",
            Self::RateLimitExceeded => "rate_limit_exceeded",
        }
    }

    /// HTTP status implied by this error code.
    #[must_use]
    pub const fn http_status(self) -> StatusCode {
        match self {
            Self::InvalidRequest
            | Self::InvalidGrant
            | Self::InvalidScope
            | Self::UnauthorizedClient
            | Self::UnsupportedGrantType
            | Self::InvalidRedirectUri => StatusCode::BAD_REQUEST,
            Self::InvalidClient | Self::InvalidToken => StatusCode::UNAUTHORIZED,
            Self::AccessDenied => StatusCode::FORBIDDEN,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            Self::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// An OAuth protocol error with its JSON envelope fields.
#[derive(Debug, Clone)]
pub struct OAuthError {
    /// Error code determining the HTTP status and `error` field.
    pub code: OAuthErrorCode,
    /// Human-readable `error_description`.
    pub description: Option<String>,
    /// Optional `error_uri` pointing at the relevant specification section.
    pub error_uri: Option<String>,
}

impl OAuthError {
    /// Create an error with the given code and description.
    #[must_use]
    pub fn new(code: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            code,
            description: Some(description.into()),
            error_uri: None,
        }
    }

    /// Create an `invalid_request` error.
    #[must_use]
    pub fn invalid_request(description: &str) -> Self {
        Self {
            code: OAuthErrorCode::InvalidRequest,
            description: Some(description.to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `invalid_grant` error.
    #[must_use]
    pub fn invalid_grant(description: &str) -> Self {
        Self {
            code: OAuthErrorCode::InvalidGrant,
            description: Some(description.to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `invalid_client` error.
    #[must_use]
    pub fn invalid_client(description: &str) -> Self {
        Self {
            code: OAuthErrorCode::InvalidClient,
            description: Some(description.to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `invalid_scope` error.
    #[must_use]
    pub fn invalid_scope(description: &str) -> Self {
        Self {
            code: OAuthErrorCode::InvalidScope,
            description: Some(description.to_owned()),
            error_uri: Some(
                "https://datatracker.ietf.org/doc/html/rfc6749#section-4.1.2.1".to_owned(),
            ),
        }
    }

    /// Create an `invalid_token` error for bearer validation failures.
    #[must_use]
    pub fn invalid_token(description: &str) -> Self {
        Self::new(OAuthErrorCode::InvalidToken, description)
    }

    /// Create an `unsupported_grant_type` error.
    #[must_use]
    pub fn unsupported_grant_type() -> Self {
        Self {
            code: OAuthErrorCode::UnsupportedGrantType,
            description: Some("Grant type not supported".to_owned()),
            error_uri: Some("https://datatracker.ietf.org/doc/html/rfc6749#section-5.2".to_owned()),
        }
    }

    /// Create an `invalid_redirect_uri` error.
    #[must_use]
    pub fn invalid_redirect_uri(description: &str) -> Self {
        Self::new(OAuthErrorCode::InvalidRedirectUri, description)
    }

    /// Create an `access_denied` error.
    #[must_use]
    pub fn access_denied(description: &str) -> Self {
        Self::new(OAuthErrorCode::AccessDenied, description)
    }

    /// Create a `server_error`.
    #[must_use]
    pub fn server_error(description: &str) -> Self {
        Self::new(OAuthErrorCode::ServerError, description)
    }

    /// Create a `temporarily_unavailable` error.
    #[must_use]
    pub fn temporarily_unavailable(description: &str) -> Self {
        Self::new(OAuthErrorCode::TemporarilyUnavailable, description)
    }

    /// Create a `rate_limit_exceeded` error.
    #[must_use]
    pub fn rate_limit_exceeded() -> Self {
        Self::new(
            OAuthErrorCode::RateLimitExceeded,
            "Rate limit exceeded, slow down",
        )
    }

    /// HTTP status for this error.
    #[must_use]
    pub const fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }
}

impl std::fmt::Display for OAuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}: {description}", self.code.as_str()),
            None => f.write_str(self.code.as_str()),
        }
    }
}

impl std::error::Error for OAuthError {}

/// Wire shape of the error envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error code name.
    pub error: String,
    /// Human-readable description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
    /// Specification reference.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_uri: Option<String>,
}

impl From<&OAuthError> for ErrorEnvelope {
    fn from(err: &OAuthError) -> Self {
        Self {
            error: err.code.as_str().to_owned(),
            error_description: err.description.clone(),
            error_uri: err.error_uri.clone(),
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        let envelope = ErrorEnvelope::from(&self);
        let mut response = (self.http_status(), Json(envelope)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        if self.code == OAuthErrorCode::RateLimitExceeded {
            headers.insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            OAuthErrorCode::InvalidRequest.http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OAuthErrorCode::InvalidClient.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            OAuthErrorCode::InvalidToken.http_status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            OAuthErrorCode::AccessDenied.http_status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            OAuthErrorCode::RateLimitExceeded.http_status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            OAuthErrorCode::TemporarilyUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn envelope_omits_empty_fields() {
        let err = OAuthError::new(OAuthErrorCode::ServerError, "boom");
        let envelope = ErrorEnvelope::from(&err);
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("server_error"));
        assert!(!json.contains("error_uri"));
    }
}
