// ABOUTME: OAuth 2.0 request/response types for registration, authorization, and tokens
// ABOUTME: Implements RFC 7591, RFC 8414, and RFC 9728 wire structures
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::errors::OAuthError;

/// Client registration request (RFC 7591).
#[derive(Debug, Deserialize)]
pub struct ClientRegistrationRequest {
    /// Redirect URIs for the authorization code flow.
    pub redirect_uris: Vec<String>,
    /// Human-readable client name.
    pub client_name: Option<String>,
    /// Grant types the client intends to use.
    pub grant_types: Option<Vec<String>>,
    /// Response types the client intends to use.
    pub response_types: Option<Vec<String>>,
    /// Token endpoint authentication method.
    pub token_endpoint_auth_method: Option<String>,
    /// Requested scope string.
    pub scope: Option<String>,
    /// Client type: `public` (default) or `confidential`.
    pub client_type: Option<String>,
}

/// Client registration response (RFC 7591). The secret appears exactly once,
/// here; only its bcrypt hash is stored.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientRegistrationResponse {
    /// Issued client identifier.
    pub client_id: String,
    /// Issued client secret (confidential clients only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Unix timestamp the identifier was issued at.
    pub client_id_issued_at: i64,
    /// Secret expiry; zero means it does not expire.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<i64>,
    /// Registered redirect URIs.
    pub redirect_uris: Vec<String>,
    /// Registered grant types.
    pub grant_types: Vec<String>,
    /// Registered response types.
    pub response_types: Vec<String>,
    /// Token endpoint authentication method.
    pub token_endpoint_auth_method: String,
    /// Client name, echoed back.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_name: Option<String>,
    /// Registered scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// Client type.
    pub client_type: String,
}

/// Parsed authorization request.
#[derive(Debug, Clone)]
pub struct AuthorizeRequest {
    /// Client identifier.
    pub client_id: String,
    /// Redirect URI, matched exactly against the registered list.
    pub redirect_uri: String,
    /// Response type; only `code` is supported.
    pub response_type: Option<String>,
    /// Requested scope.
    pub scope: Option<String>,
    /// Client CSRF state.
    pub state: Option<String>,
    /// PKCE challenge.
    pub code_challenge: Option<String>,
    /// PKCE challenge method.
    pub code_challenge_method: Option<String>,
    /// OIDC nonce.
    pub nonce: Option<String>,
    /// OIDC prompt, forwarded upstream (`none` enables silent auth).
    pub prompt: Option<String>,
}

impl AuthorizeRequest {
    /// Parse query parameters into an authorization request.
    ///
    /// # Errors
    /// Returns `invalid_request` when a required parameter is missing.
    pub fn from_query(params: &HashMap<String, String>) -> Result<Self, OAuthError> {
        let client_id = params
            .get("client_id")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing client_id parameter"))?
            .clone();

        let redirect_uri = params
            .get("redirect_uri")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing redirect_uri parameter"))?
            .clone();

        Ok(Self {
            client_id,
            redirect_uri,
            response_type: params.get("response_type").cloned(),
            scope: params.get("scope").cloned(),
            state: params.get("state").cloned().filter(|s| !s.is_empty()),
            code_challenge: params.get("code_challenge").cloned(),
            code_challenge_method: params.get("code_challenge_method").cloned(),
            nonce: params.get("nonce").cloned(),
            prompt: params.get("prompt").cloned(),
        })
    }
}

/// Parsed token endpoint request.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    /// Grant type dispatch key.
    pub grant_type: String,
    /// Authorization code (`authorization_code` grant).
    pub code: Option<String>,
    /// Redirect URI, must equal the one bound to the code.
    pub redirect_uri: Option<String>,
    /// Client identifier; optional when the code carries it.
    pub client_id: Option<String>,
    /// Client secret from the form body.
    pub client_secret: Option<String>,
    /// Refresh token (`refresh_token` grant).
    pub refresh_token: Option<String>,
    /// PKCE code verifier.
    pub code_verifier: Option<String>,
}

impl TokenRequest {
    /// Parse form fields into a token request.
    ///
    /// # Errors
    /// Returns `invalid_request` when `grant_type` is missing.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, OAuthError> {
        let grant_type = form
            .get("grant_type")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing grant_type parameter"))?
            .clone();

        Ok(Self {
            grant_type,
            code: form.get("code").cloned(),
            redirect_uri: form.get("redirect_uri").cloned(),
            client_id: form.get("client_id").cloned().filter(|v| !v.is_empty()),
            client_secret: form.get("client_secret").cloned().filter(|v| !v.is_empty()),
            refresh_token: form.get("refresh_token").cloned(),
            code_verifier: form.get("code_verifier").cloned(),
        })
    }
}

/// Token endpoint response.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Opaque bearer access token.
    pub access_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Seconds until the access token expires.
    pub expires_in: i64,
    /// Refresh token, when one was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Granted scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Parsed revocation request (RFC 7009).
#[derive(Debug, Clone)]
pub struct RevokeRequest {
    /// The token to revoke.
    pub token: String,
    /// Caller's guess at the token type.
    pub token_type_hint: Option<String>,
    /// Client identifier.
    pub client_id: Option<String>,
    /// Client secret from the form body.
    pub client_secret: Option<String>,
}

impl RevokeRequest {
    /// Parse form fields into a revocation request.
    ///
    /// # Errors
    /// Returns `invalid_request` when `token` is missing.
    pub fn from_form(form: &HashMap<String, String>) -> Result<Self, OAuthError> {
        let token = form
            .get("token")
            .filter(|v| !v.is_empty())
            .ok_or_else(|| OAuthError::invalid_request("Missing token parameter"))?
            .clone();

        Ok(Self {
            token,
            token_type_hint: form.get("token_type_hint").cloned(),
            client_id: form.get("client_id").cloned().filter(|v| !v.is_empty()),
            client_secret: form.get("client_secret").cloned().filter(|v| !v.is_empty()),
        })
    }
}

/// Authorization server metadata (RFC 8414).
#[derive(Debug, Serialize, Deserialize)]
pub struct AuthorizationServerMetadata {
    /// Issuer identifier.
    pub issuer: String,
    /// Authorization endpoint URL.
    pub authorization_endpoint: String,
    /// Token endpoint URL.
    pub token_endpoint: String,
    /// Registration endpoint URL.
    pub registration_endpoint: String,
    /// Revocation endpoint URL.
    pub revocation_endpoint: String,
    /// Scopes this server supports.
    pub scopes_supported: Vec<String>,
    /// Only `code`.
    pub response_types_supported: Vec<String>,
    /// `authorization_code` and `refresh_token`.
    pub grant_types_supported: Vec<String>,
    /// Supported client authentication methods.
    pub token_endpoint_auth_methods_supported: Vec<String>,
    /// Only `S256`; `plain` is never advertised.
    pub code_challenge_methods_supported: Vec<String>,
    /// Only `query`.
    pub response_modes_supported: Vec<String>,
}

impl AuthorizationServerMetadata {
    /// Build the metadata document for an issuer.
    #[must_use]
    pub fn for_issuer(issuer: &str, scopes: &[String]) -> Self {
        Self {
            issuer: issuer.to_owned(),
            authorization_endpoint: format!("{issuer}/oauth/authorize"),
            token_endpoint: format!("{issuer}/oauth/token"),
            registration_endpoint: format!("{issuer}/oauth/register"),
            revocation_endpoint: format!("{issuer}/oauth/revoke"),
            scopes_supported: scopes.to_vec(),
            response_types_supported: vec!["code".to_owned()],
            grant_types_supported: vec![
                "authorization_code".to_owned(),
                "refresh_token".to_owned(),
            ],
            token_endpoint_auth_methods_supported: vec![
                "client_secret_basic".to_owned(),
                "client_secret_post".to_owned(),
                "none".to_owned(),
            ],
            code_challenge_methods_supported: vec!["S256".to_owned()],
            response_modes_supported: vec!["query".to_owned()],
        }
    }
}

/// Protected resource metadata (RFC 9728).
#[derive(Debug, Serialize, Deserialize)]
pub struct ProtectedResourceMetadata {
    /// Resource identifier.
    pub resource: String,
    /// Authorization servers protecting this resource.
    pub authorization_servers: Vec<String>,
    /// Scopes understood by the resource.
    pub scopes_supported: Vec<String>,
    /// How bearers are presented.
    pub bearer_methods_supported: Vec<String>,
}

impl ProtectedResourceMetadata {
    /// Build the metadata document for a resource fronted by this server.
    #[must_use]
    pub fn for_issuer(issuer: &str, scopes: &[String]) -> Self {
        Self {
            resource: issuer.to_owned(),
            authorization_servers: vec![issuer.to_owned()],
            scopes_supported: scopes.to_vec(),
            bearer_methods_supported: vec!["header".to_owned()],
        }
    }
}
