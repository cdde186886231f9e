// ABOUTME: Environment configuration management for the authorization gateway
// ABOUTME: Loads, validates, and exposes the explicit ServerConfig value
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Environment-based configuration.
//!
//! The gateway takes its configuration as one explicit [`ServerConfig`] value.
//! [`ServerConfig::from_env`] reads the recognized environment variables,
//! applies defaults, and validates the result; nothing else in the crate
//! touches the process environment.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use std::env;
use tracing::{info, warn};
use url::Url;

use crate::constants::{cleanup, google, lifetimes, limits};

/// Upstream identity provider settings.
#[derive(Debug, Clone)]
pub struct IdpConfig {
    /// OAuth client ID issued by the provider.
    pub client_id: String,
    /// OAuth client secret issued by the provider.
    pub client_secret: String,
    /// Authorization endpoint.
    pub auth_url: String,
    /// Token endpoint.
    pub token_url: String,
    /// Userinfo endpoint.
    pub userinfo_url: String,
    /// Scopes requested from the provider.
    pub scopes: Vec<String>,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            client_secret: String::new(),
            auth_url: google::AUTH_URL.to_owned(),
            token_url: google::TOKEN_URL.to_owned(),
            userinfo_url: google::USERINFO_URL.to_owned(),
            scopes: google::DEFAULT_SCOPES
                .iter()
                .map(|s| (*s).to_owned())
                .collect(),
        }
    }
}

/// Token-bucket rate limit settings. A rate of zero disables that layer.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    /// Per-IP sustained rate in requests per second.
    pub rate: f64,
    /// Per-IP burst capacity.
    pub burst: u32,
    /// Per-user sustained rate in requests per second.
    pub user_rate: f64,
    /// Per-user burst capacity.
    pub user_burst: u32,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            rate: 10.0,
            burst: 20,
            user_rate: 5.0,
            user_burst: 10,
        }
    }
}

/// Dynamic client registration policy.
#[derive(Debug, Clone)]
pub struct RegistrationPolicy {
    /// Whether unauthenticated registration is accepted.
    pub allow_public: bool,
    /// Pre-shared token required when public registration is disabled.
    pub access_token: Option<String>,
    /// Cap on active registrations per source IP.
    pub max_clients_per_ip: u32,
}

impl Default for RegistrationPolicy {
    fn default() -> Self {
        Self {
            allow_public: true,
            access_token: None,
            max_clients_per_ip: limits::MAX_CLIENTS_PER_IP,
        }
    }
}

/// Redirect-URI security policy knobs.
#[derive(Debug, Clone, Copy)]
pub struct RedirectUriSecurity {
    /// Loopback hosts are always permitted.
    pub allow_loopback: bool,
    /// Permit RFC 1918 hosts even in production.
    pub allow_private_ip: bool,
    /// Permit link-local hosts even in production.
    pub allow_link_local: bool,
    /// Require the host to resolve via DNS.
    pub strict_dns: bool,
    /// Enforce https for non-loopback redirects.
    pub production_mode: bool,
}

impl Default for RedirectUriSecurity {
    fn default() -> Self {
        Self {
            allow_loopback: true,
            allow_private_ip: false,
            allow_link_local: false,
            strict_dns: false,
            production_mode: false,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Issuer and callback root, e.g. `https://gateway.example.com`.
    pub base_url: String,
    /// Socket address the HTTP server binds.
    pub bind_addr: String,
    /// Upstream identity provider.
    pub idp: IdpConfig,
    /// Accept forwarded client-IP headers from a trusted proxy.
    pub trust_proxy: bool,
    /// Rate limit layers.
    pub rate_limit: RateLimitSettings,
    /// Registration policy.
    pub registration: RegistrationPolicy,
    /// Permit `state` omission at the authorization endpoint.
    pub allow_insecure_auth_without_state: bool,
    /// Accept `plain` PKCE challenges at the token endpoint.
    pub allow_plain_pkce: bool,
    /// Rotate refresh tokens on use (reuse detection requires rotation).
    pub rotate_refresh_tokens: bool,
    /// Refresh token lifetime in days.
    pub refresh_token_ttl_days: i64,
    /// Emit structured audit events.
    pub enable_audit_logging: bool,
    /// 32-byte AES-256-GCM key for token sealing; `None` stores plaintext.
    pub encryption_key: Option<[u8; 32]>,
    /// Redirect-URI security policy.
    pub redirect_uri_security: RedirectUriSecurity,
    /// Additional client IDs whose provider-issued ID tokens are accepted
    /// for SSO forwarding.
    pub trusted_audiences: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_owned(),
            bind_addr: "127.0.0.1:8080".to_owned(),
            idp: IdpConfig::default(),
            trust_proxy: false,
            rate_limit: RateLimitSettings::default(),
            registration: RegistrationPolicy::default(),
            allow_insecure_auth_without_state: false,
            allow_plain_pkce: false,
            rotate_refresh_tokens: true,
            refresh_token_ttl_days: lifetimes::REFRESH_TOKEN_TTL_DAYS,
            enable_audit_logging: true,
            encryption_key: None,
            redirect_uri_security: RedirectUriSecurity::default(),
            trusted_audiences: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    /// Returns an error if a variable holds an invalid value or the combined
    /// configuration fails validation.
    pub fn from_env() -> Result<Self> {
        let base_url =
            env::var("GATEWAY_BASE_URL").unwrap_or_else(|_| "http://localhost:8080".to_owned());
        let bind_addr =
            env::var("GATEWAY_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_owned());

        let redirect_default = RedirectUriSecurity {
            production_mode: base_url_is_production(&base_url),
            ..RedirectUriSecurity::default()
        };

        let config = Self {
            base_url,
            bind_addr,
            idp: Self::load_idp_config(),
            trust_proxy: env_bool("TRUST_PROXY", false)?,
            rate_limit: RateLimitSettings {
                rate: env_f64("RATE_LIMIT_RATE", 10.0)?,
                burst: env_u32("RATE_LIMIT_BURST", 20)?,
                user_rate: env_f64("RATE_LIMIT_USER_RATE", 5.0)?,
                user_burst: env_u32("RATE_LIMIT_USER_BURST", 10)?,
            },
            registration: RegistrationPolicy {
                allow_public: env_bool("ALLOW_PUBLIC_CLIENT_REGISTRATION", true)?,
                access_token: env::var("REGISTRATION_ACCESS_TOKEN").ok().filter(|s| !s.is_empty()),
                max_clients_per_ip: env_u32("MAX_CLIENTS_PER_IP", limits::MAX_CLIENTS_PER_IP)?,
            },
            allow_insecure_auth_without_state: env_bool("ALLOW_INSECURE_AUTH_WITHOUT_STATE", false)?,
            allow_plain_pkce: env_bool("ALLOW_PLAIN_PKCE", false)?,
            rotate_refresh_tokens: env_bool("ROTATE_REFRESH_TOKENS", true)?,
            refresh_token_ttl_days: env_i64(
                "REFRESH_TOKEN_TTL_DAYS",
                lifetimes::REFRESH_TOKEN_TTL_DAYS,
            )?,
            enable_audit_logging: env_bool("ENABLE_AUDIT_LOGGING", true)?,
            encryption_key: load_encryption_key()?,
            redirect_uri_security: RedirectUriSecurity {
                allow_loopback: env_bool("REDIRECT_ALLOW_LOOPBACK", redirect_default.allow_loopback)?,
                allow_private_ip: env_bool(
                    "REDIRECT_ALLOW_PRIVATE_IP",
                    redirect_default.allow_private_ip,
                )?,
                allow_link_local: env_bool(
                    "REDIRECT_ALLOW_LINK_LOCAL",
                    redirect_default.allow_link_local,
                )?,
                strict_dns: env_bool("REDIRECT_STRICT_DNS", redirect_default.strict_dns)?,
                production_mode: env_bool(
                    "REDIRECT_PRODUCTION_MODE",
                    redirect_default.production_mode,
                )?,
            },
            trusted_audiences: env::var("TRUSTED_AUDIENCES")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
        };

        config.validate()?;
        info!(
            base_url = %config.base_url,
            sealing = config.encryption_key.is_some(),
            "configuration loaded"
        );
        Ok(config)
    }

    fn load_idp_config() -> IdpConfig {
        let defaults = IdpConfig::default();
        IdpConfig {
            client_id: env::var("IDP_CLIENT_ID").unwrap_or_default(),
            client_secret: env::var("IDP_CLIENT_SECRET").unwrap_or_default(),
            auth_url: env::var("IDP_AUTH_URL").unwrap_or(defaults.auth_url),
            token_url: env::var("IDP_TOKEN_URL").unwrap_or(defaults.token_url),
            userinfo_url: env::var("IDP_USERINFO_URL").unwrap_or(defaults.userinfo_url),
            scopes: env::var("IDP_SCOPES")
                .map(|v| v.split_whitespace().map(str::to_owned).collect())
                .unwrap_or(defaults.scopes),
        }
    }

    /// Validate configuration values.
    ///
    /// # Errors
    /// Returns an error if values are invalid or conflicting.
    pub fn validate(&self) -> Result<()> {
        let base = Url::parse(&self.base_url)
            .with_context(|| format!("invalid GATEWAY_BASE_URL: {}", self.base_url))?;
        if base.host_str().is_none() {
            return Err(anyhow!("GATEWAY_BASE_URL must include a host"));
        }

        if self.idp.client_id.is_empty() || self.idp.client_secret.is_empty() {
            warn!("identity provider credentials are not configured; delegated flows will fail");
        }

        if self.refresh_token_ttl_days <= 0 {
            return Err(anyhow!("REFRESH_TOKEN_TTL_DAYS must be positive"));
        }

        if !self.registration.allow_public && self.registration.access_token.is_none() {
            return Err(anyhow!(
                "public client registration is disabled but no REGISTRATION_ACCESS_TOKEN is set"
            ));
        }

        Ok(())
    }

    /// The callback URL registered with the upstream provider.
    #[must_use]
    pub fn callback_url(&self) -> String {
        format!("{}/oauth/callback", self.base_url.trim_end_matches('/'))
    }

    /// Issuer identifier for metadata documents.
    #[must_use]
    pub fn issuer(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// URL of the protected-resource metadata document, advertised in
    /// `WWW-Authenticate` challenges.
    #[must_use]
    pub fn resource_metadata_url(&self) -> String {
        format!(
            "{}/.well-known/oauth-protected-resource",
            self.base_url.trim_end_matches('/')
        )
    }

    /// Store sweep interval.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(cleanup::STORE_SWEEP_INTERVAL_SECS)
    }
}

/// Whether the configured base URL points at a non-loopback host, in which
/// case redirect-URI validation runs in production mode.
fn base_url_is_production(base_url: &str) -> bool {
    Url::parse(base_url).map_or(false, |url| {
        url.host_str().map_or(false, |host| {
            !crate::redirect::is_loopback_host(host)
        })
    })
}

fn load_encryption_key() -> Result<Option<[u8; 32]>> {
    let Ok(encoded) = env::var("TOKEN_ENCRYPTION_KEY") else {
        return Ok(None);
    };
    if encoded.is_empty() {
        return Ok(None);
    }
    let bytes = general_purpose::STANDARD
        .decode(&encoded)
        .context("TOKEN_ENCRYPTION_KEY is not valid base64")?;
    if bytes.len() != 32 {
        return Err(anyhow!(
            "TOKEN_ENCRYPTION_KEY must decode to exactly 32 bytes, got {}",
            bytes.len()
        ));
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(Some(key))
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match env::var(name) {
        Ok(v) => match v.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => Err(anyhow!("{name} must be a boolean, got {other:?}")),
        },
        Err(_) => Ok(default),
    }
}

fn env_u32(name: &str, default: u32) -> Result<u32> {
    match env::var(name) {
        Ok(v) => v
            .parse::<u32>()
            .with_context(|| format!("{name} must be an unsigned integer")),
        Err(_) => Ok(default),
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match env::var(name) {
        Ok(v) => v
            .parse::<i64>()
            .with_context(|| format!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}

fn env_f64(name: &str, default: f64) -> Result<f64> {
    match env::var(name) {
        Ok(v) => v
            .parse::<f64>()
            .with_context(|| format!("{name} must be a number")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ServerConfig::default().validate().unwrap();
    }

    #[test]
    fn production_mode_follows_base_url_host() {
        assert!(!base_url_is_production("http://localhost:8080"));
        assert!(!base_url_is_production("http://127.0.0.1:8080"));
        assert!(base_url_is_production("https://gateway.example.com"));
    }

    #[test]
    fn closed_registration_requires_token() {
        let config = ServerConfig {
            registration: RegistrationPolicy {
                allow_public: false,
                access_token: None,
                max_clients_per_ip: 10,
            },
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn callback_url_strips_trailing_slash() {
        let config = ServerConfig {
            base_url: "https://gw.example.com/".to_owned(),
            ..ServerConfig::default()
        };
        assert_eq!(config.callback_url(), "https://gw.example.com/oauth/callback");
    }
}
