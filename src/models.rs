// ABOUTME: Core data entities for clients, flow state, codes, and upstream tokens
// ABOUTME: Owned by the store; handlers and middleware operate on copies
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Data model for the authorization gateway.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::lifetimes;

/// Whether a client can keep a secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// Browser or native app; authenticates with PKCE only.
    Public,
    /// Server-side client holding a secret.
    Confidential,
}

impl ClientType {
    /// Parse the registration wire value, defaulting to public.
    #[must_use]
    pub fn from_wire(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("public") => Some(Self::Public),
            Some("confidential") => Some(Self::Confidential),
            Some(_) => None,
        }
    }

    /// Wire name of the client type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Confidential => "confidential",
        }
    }
}

/// How the client authenticates at the token endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenEndpointAuthMethod {
    /// HTTP Basic with the client identifier as username.
    ClientSecretBasic,
    /// `client_secret` form parameter.
    ClientSecretPost,
    /// No client authentication (public clients).
    None,
}

impl TokenEndpointAuthMethod {
    /// Parse the registration wire value.
    #[must_use]
    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "client_secret_basic" => Some(Self::ClientSecretBasic),
            "client_secret_post" => Some(Self::ClientSecretPost),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Wire name of the auth method.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientSecretBasic => "client_secret_basic",
            Self::ClientSecretPost => "client_secret_post",
            Self::None => "none",
        }
    }

    /// Whether this method requires a stored secret.
    #[must_use]
    pub const fn requires_secret(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// A dynamically registered OAuth client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredClient {
    /// Opaque client identifier, unique across the store.
    pub client_id: String,
    /// bcrypt hash of the client secret; present only for confidential clients.
    pub secret_hash: Option<String>,
    /// When the registration was created.
    pub created_at: DateTime<Utc>,
    /// Non-empty ordered list of registered redirect URIs.
    pub redirect_uris: Vec<String>,
    /// Token endpoint authentication method.
    pub auth_method: TokenEndpointAuthMethod,
    /// Grant types the client may use.
    pub grant_types: Vec<String>,
    /// Response types the client may use.
    pub response_types: Vec<String>,
    /// Human-readable name.
    pub client_name: Option<String>,
    /// Requested scope string.
    pub scope: Option<String>,
    /// Public or confidential.
    pub client_type: ClientType,
    /// Source IP the registration came from, for quota accounting.
    pub registered_from: Option<String>,
}

/// PKCE challenge method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PkceMethod {
    /// SHA-256 challenge (the only advertised method).
    S256,
    /// Plaintext challenge; accepted only when explicitly configured.
    Plain,
}

impl PkceMethod {
    /// Parse the wire value, defaulting to S256 when absent.
    #[must_use]
    pub fn from_wire(value: Option<&str>) -> Option<Self> {
        match value {
            None | Some("S256") => Some(Self::S256),
            Some("plain") => Some(Self::Plain),
            Some(_) => None,
        }
    }
}

/// A PKCE challenge bound to an authorization request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PkceChallenge {
    /// The challenge value supplied by the client.
    pub challenge: String,
    /// The challenge method.
    pub method: PkceMethod,
}

/// Pending authorization flow, keyed by the upstream state token.
#[derive(Debug, Clone)]
pub struct FlowState {
    /// The client-supplied `state`, echoed back on completion. Empty only
    /// when the permissive configuration flag allows it.
    pub client_state: Option<String>,
    /// Client that started the flow.
    pub client_id: String,
    /// Redirect URI the flow completes to.
    pub redirect_uri: String,
    /// Requested scope.
    pub scope: String,
    /// PKCE challenge, if the client supplied one.
    pub pkce: Option<PkceChallenge>,
    /// OIDC nonce passed through to the provider.
    pub nonce: Option<String>,
    /// Whether the client asked for a non-interactive (`prompt=none`) flow.
    pub prompt: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

impl FlowState {
    /// Whether the flow state has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A single-use authorization code minted after the upstream callback.
#[derive(Debug, Clone)]
pub struct AuthorizationCode {
    /// Client the code is bound to.
    pub client_id: String,
    /// Redirect URI the code is bound to.
    pub redirect_uri: String,
    /// Granted scope.
    pub scope: String,
    /// PKCE challenge carried over from the flow.
    pub pkce: Option<PkceChallenge>,
    /// Upstream token triple captured during the callback exchange.
    pub upstream: UpstreamToken,
    /// Authenticated user email.
    pub user_email: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Expiry timestamp.
    pub expires_at: DateTime<Utc>,
}

impl AuthorizationCode {
    /// Whether the code has expired.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// The upstream identity provider's OAuth token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamToken {
    /// Upstream access token.
    pub access_token: String,
    /// Upstream refresh token, when the provider granted offline access.
    pub refresh_token: Option<String>,
    /// Absolute expiry of the access token.
    pub expires_at: DateTime<Utc>,
}

impl UpstreamToken {
    /// Whether the access token expires within the given window.
    #[must_use]
    pub fn expires_within(&self, window: Duration) -> bool {
        self.expires_at <= Utc::now() + window
    }

    /// Whether the access token needs a refresh before being handed to a
    /// token-endpoint response.
    #[must_use]
    pub fn needs_exchange_refresh(&self) -> bool {
        self.expires_within(Duration::seconds(lifetimes::UPSTREAM_REFRESH_SKEW_SECS))
    }
}

/// Mapping entry for an issued refresh token.
#[derive(Debug, Clone)]
pub struct RefreshTokenRecord {
    /// Owning user email.
    pub user_email: String,
    /// Absolute expiry.
    pub expires_at: DateTime<Utc>,
}

/// User identity returned by the provider's userinfo endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Primary email; the user key throughout the store.
    pub email: String,
    /// Display name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Avatar URL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picture: Option<String>,
    /// Whether the provider reports the email as verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_verified: Option<bool>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn client_type_wire_round_trip() {
        assert_eq!(ClientType::from_wire(None), Some(ClientType::Public));
        assert_eq!(
            ClientType::from_wire(Some("confidential")),
            Some(ClientType::Confidential)
        );
        assert_eq!(ClientType::from_wire(Some("hybrid")), None);
    }

    #[test]
    fn pkce_method_defaults_to_s256() {
        assert_eq!(PkceMethod::from_wire(None), Some(PkceMethod::S256));
        assert_eq!(PkceMethod::from_wire(Some("plain")), Some(PkceMethod::Plain));
        assert_eq!(PkceMethod::from_wire(Some("s256")), None);
    }

    #[test]
    fn upstream_token_freshness_window() {
        let fresh = UpstreamToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!fresh.needs_exchange_refresh());

        let stale = UpstreamToken {
            access_token: "a".into(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::seconds(30),
        };
        assert!(stale.needs_exchange_refresh());
    }
}
