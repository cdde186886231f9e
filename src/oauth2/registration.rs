// ABOUTME: Dynamic client registration (RFC 7591) with client-type discipline
// ABOUTME: Enforces redirect policy, per-IP quota, and the registration access token
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

use std::net::IpAddr;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::models::{ClientRegistrationRequest, ClientRegistrationResponse};
use crate::audit::{AuditEvent, AuditEventKind};
use crate::constants::tokens;
use crate::context::ServerContext;
use crate::crypto;
use crate::errors::{OAuthError, OAuthErrorCode};
use crate::models::{ClientType, RegisteredClient, TokenEndpointAuthMethod};
use crate::redirect::validate_redirect_uri;

const SUPPORTED_GRANT_TYPES: &[&str] = &["authorization_code", "refresh_token"];
const SUPPORTED_RESPONSE_TYPES: &[&str] = &["code"];

/// Client registration manager.
pub struct ClientRegistrar {
    ctx: Arc<ServerContext>,
}

impl ClientRegistrar {
    /// Create a registrar over the shared context.
    #[must_use]
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// Register a new client.
    ///
    /// # Errors
    /// Returns an error when the request violates the registration policy,
    /// the per-IP quota is exhausted, or credential generation fails.
    pub async fn register(
        &self,
        request: ClientRegistrationRequest,
        source_ip: Option<IpAddr>,
        registration_token: Option<&str>,
    ) -> Result<ClientRegistrationResponse, OAuthError> {
        self.check_registration_access(registration_token)?;
        self.check_ip_quota(source_ip).await?;

        if request.redirect_uris.is_empty() {
            return Err(OAuthError::invalid_request(
                "At least one redirect_uri is required",
            ));
        }
        for uri in &request.redirect_uris {
            validate_redirect_uri(uri, &self.ctx.config.redirect_uri_security)
                .await
                .map_err(|e| {
                    OAuthError::invalid_redirect_uri(&format!("Invalid redirect_uri {uri:?}: {e}"))
                })?;
        }

        let client_type = ClientType::from_wire(request.client_type.as_deref())
            .ok_or_else(|| OAuthError::invalid_request("Unknown client_type"))?;

        let auth_method = match request.token_endpoint_auth_method.as_deref() {
            Some(value) => TokenEndpointAuthMethod::from_wire(value).ok_or_else(|| {
                OAuthError::invalid_request("Unknown token_endpoint_auth_method")
            })?,
            None => match client_type {
                ClientType::Public => TokenEndpointAuthMethod::None,
                ClientType::Confidential => TokenEndpointAuthMethod::ClientSecretBasic,
            },
        };

        // Client-type / auth-method matrix.
        match (client_type, auth_method.requires_secret()) {
            (ClientType::Public, true) => {
                return Err(OAuthError::invalid_request(
                    "Public clients must use token_endpoint_auth_method \"none\"",
                ));
            }
            (ClientType::Confidential, false) => {
                return Err(OAuthError::invalid_request(
                    "Confidential clients require a secret-based token_endpoint_auth_method",
                ));
            }
            _ => {}
        }

        let grant_types = request.grant_types.unwrap_or_else(|| {
            SUPPORTED_GRANT_TYPES.iter().map(|g| (*g).to_owned()).collect()
        });
        for grant in &grant_types {
            if !SUPPORTED_GRANT_TYPES.contains(&grant.as_str()) {
                return Err(OAuthError::invalid_request(&format!(
                    "Unsupported grant_type: {grant}"
                )));
            }
        }

        let response_types = request
            .response_types
            .unwrap_or_else(|| vec!["code".to_owned()]);
        for response_type in &response_types {
            if !SUPPORTED_RESPONSE_TYPES.contains(&response_type.as_str()) {
                return Err(OAuthError::invalid_request(&format!(
                    "Unsupported response_type: {response_type}"
                )));
            }
        }

        let client_id = format!("mcp_{}", Uuid::new_v4().simple());
        let (client_secret, secret_hash) = match client_type {
            ClientType::Public => (None, None),
            ClientType::Confidential => {
                let secret = crypto::generate_token(tokens::CLIENT_SECRET_BYTES)
                    .map_err(|_| OAuthError::server_error("Failed to generate client secret"))?;
                let hash = crypto::hash_secret(&secret)
                    .await
                    .map_err(|_| OAuthError::server_error("Failed to hash client secret"))?;
                (Some(secret), Some(hash))
            }
        };

        let created_at = Utc::now();
        let client = RegisteredClient {
            client_id: client_id.clone(),
            secret_hash,
            created_at,
            redirect_uris: request.redirect_uris.clone(),
            auth_method,
            grant_types: grant_types.clone(),
            response_types: response_types.clone(),
            client_name: request.client_name.clone(),
            scope: request.scope.clone(),
            client_type,
            registered_from: source_ip.map(|ip| ip.to_string()),
        };
        self.ctx.store.insert_client(client).await;

        self.ctx.audit.log(
            &AuditEvent::new(AuditEventKind::ClientRegistered)
                .with_client(client_id.clone())
                .with_source_ip(
                    source_ip.map_or_else(|| "unknown".to_owned(), |ip| ip.to_string()),
                )
                .with_metadata(serde_json::json!({
                    "client_type": client_type.as_str(),
                    "redirect_uris": request.redirect_uris.len(),
                })),
        );

        Ok(ClientRegistrationResponse {
            client_id,
            client_secret,
            client_id_issued_at: created_at.timestamp(),
            client_secret_expires_at: match client_type {
                ClientType::Public => None,
                ClientType::Confidential => Some(0),
            },
            redirect_uris: request.redirect_uris,
            grant_types,
            response_types,
            token_endpoint_auth_method: auth_method.as_str().to_owned(),
            client_name: request.client_name,
            scope: request.scope,
            client_type: client_type.as_str().to_owned(),
        })
    }

    fn check_registration_access(&self, token: Option<&str>) -> Result<(), OAuthError> {
        let policy = &self.ctx.config.registration;
        if policy.allow_public {
            return Ok(());
        }
        let Some(expected) = policy.access_token.as_deref() else {
            return Err(OAuthError::invalid_client(
                "Client registration is disabled",
            ));
        };
        match token {
            Some(presented) if crypto::constant_time_eq(presented, expected) => Ok(()),
            _ => Err(OAuthError::invalid_client(
                "A registration access token is required",
            )),
        }
    }

    async fn check_ip_quota(&self, source_ip: Option<IpAddr>) -> Result<(), OAuthError> {
        let Some(ip) = source_ip else {
            return Ok(());
        };
        let count = self.ctx.store.registrations_from(&ip.to_string()).await;
        if count >= self.ctx.config.registration.max_clients_per_ip {
            self.ctx.audit.log(
                &AuditEvent::new(AuditEventKind::ClientRegistrationDenied)
                    .with_source_ip(ip.to_string())
                    .failed("per-IP registration quota exhausted"),
            );
            return Err(OAuthError::new(
                OAuthErrorCode::RateLimitExceeded,
                "Too many registered clients from this address",
            ));
        }
        Ok(())
    }
}
