// ABOUTME: Structured security audit logging with PII hashing and severity levels
// ABOUTME: Emits leveled tracing events; raw emails and tokens never reach attributes
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! # Security audit events
//!
//! Every security-relevant operation (registration, authorization,
//! token issuance, refresh rotation, reuse detection, revocation) emits an
//! [`AuditEvent`]. Successful events log at `info`, failures and security
//! events at `warn`. User identifiers are hashed before they become
//! attributes; raw emails and token strings never appear in output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::audit_hash;

/// Kinds of audited operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A client completed dynamic registration.
    ClientRegistered,
    /// A registration attempt was rejected.
    ClientRegistrationDenied,
    /// An authorization flow started and was delegated upstream.
    AuthorizationStarted,
    /// The upstream callback completed and a code was minted.
    AuthorizationCompleted,
    /// The authorization flow failed.
    AuthorizationFailed,
    /// An authorization code was exchanged for tokens.
    CodeExchanged,
    /// A refresh grant succeeded.
    TokenRefreshed,
    /// A rotated refresh token was presented again.
    TokenReuseDetected,
    /// A token was revoked via the revocation endpoint.
    TokenRevoked,
    /// An upstream refresh attempt failed.
    UpstreamRefreshFailed,
    /// A request was rejected by a rate limiter.
    RateLimited,
    /// A forwarded SSO token was stored.
    SsoTokenStored,
}

impl AuditEventKind {
    /// Wire name used in log attributes.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ClientRegistered => "client_registered",
            Self::ClientRegistrationDenied => "client_registration_denied",
            Self::AuthorizationStarted => "authorization_started",
            Self::AuthorizationCompleted => "authorization_completed",
            Self::AuthorizationFailed => "authorization_failed",
            Self::CodeExchanged => "code_exchanged",
            Self::TokenRefreshed => "token_refreshed",
            Self::TokenReuseDetected => "token_reuse_detected",
            Self::TokenRevoked => "token_revoked",
            Self::UpstreamRefreshFailed => "upstream_refresh_failed",
            Self::RateLimited => "rate_limited",
            Self::SsoTokenStored => "sso_token_stored",
        }
    }
}

/// Event severity. Info logs at `info`; everything else logs at `warn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditSeverity {
    /// Routine successful operation.
    Info,
    /// Failed operation or policy rejection.
    Warning,
    /// Compromise evidence, e.g. refresh token reuse.
    High,
}

/// An immutable audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// What happened.
    pub kind: AuditEventKind,
    /// How serious it is.
    pub severity: AuditSeverity,
    /// When it happened.
    pub timestamp: DateTime<Utc>,
    /// Hashed user identifier (16 hex chars), never the raw email.
    pub user_hash: Option<String>,
    /// Client involved, if any.
    pub client_id: Option<String>,
    /// Source IP, if known.
    pub source_ip: Option<String>,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Error text for failures.
    pub error: Option<String>,
    /// Free-form metadata.
    pub metadata: serde_json::Value,
}

impl AuditEvent {
    /// Create a successful event of the given kind.
    #[must_use]
    pub fn new(kind: AuditEventKind) -> Self {
        Self {
            kind,
            severity: AuditSeverity::Info,
            timestamp: Utc::now(),
            user_hash: None,
            client_id: None,
            source_ip: None,
            success: true,
            error: None,
            metadata: serde_json::Value::Null,
        }
    }

    /// Mark the event as a failure with the given error text. High severity
    /// is preserved.
    #[must_use]
    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        if self.severity == AuditSeverity::Info {
            self.severity = AuditSeverity::Warning;
        }
        self.error = Some(error.into());
        self
    }

    /// Raise the severity to high (security events).
    #[must_use]
    pub const fn high_severity(mut self) -> Self {
        self.severity = AuditSeverity::High;
        self
    }

    /// Attach a user identifier; stored hashed.
    #[must_use]
    pub fn with_user(mut self, identifier: &str) -> Self {
        self.user_hash = Some(audit_hash(identifier));
        self
    }

    /// Attach the client identifier.
    #[must_use]
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach the source IP.
    #[must_use]
    pub fn with_source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    /// Attach metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Sink for audit events. Disabled loggers drop events silently.
#[derive(Debug, Clone)]
pub struct AuditLogger {
    enabled: bool,
}

impl AuditLogger {
    /// Create a logger; `enabled = false` turns it into a no-op.
    #[must_use]
    pub const fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Emit an event at the level implied by its severity.
    pub fn log(&self, event: &AuditEvent) {
        if !self.enabled {
            return;
        }
        match event.severity {
            AuditSeverity::Info => {
                tracing::info!(
                    target: "audit",
                    kind = event.kind.as_str(),
                    user = event.user_hash.as_deref(),
                    client_id = event.client_id.as_deref(),
                    source_ip = event.source_ip.as_deref(),
                    success = event.success,
                    metadata = %event.metadata,
                    "audit event"
                );
            }
            AuditSeverity::Warning => {
                tracing::warn!(
                    target: "audit",
                    kind = event.kind.as_str(),
                    user = event.user_hash.as_deref(),
                    client_id = event.client_id.as_deref(),
                    source_ip = event.source_ip.as_deref(),
                    success = event.success,
                    error = event.error.as_deref(),
                    metadata = %event.metadata,
                    "audit event"
                );
            }
            AuditSeverity::High => {
                tracing::warn!(
                    target: "audit",
                    kind = event.kind.as_str(),
                    severity = "high",
                    user = event.user_hash.as_deref(),
                    client_id = event.client_id.as_deref(),
                    source_ip = event.source_ip.as_deref(),
                    success = event.success,
                    error = event.error.as_deref(),
                    metadata = %event.metadata,
                    "security audit event"
                );
            }
        }
    }
}
