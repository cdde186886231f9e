// ABOUTME: Shared dependency bundle handed to routes and middleware via Arc
// ABOUTME: Owns the config, store, provider, audit logger, and rate limiters
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Server context shared across handlers.

use std::sync::Arc;
use std::time::Duration;

use crate::audit::AuditLogger;
use crate::config::ServerConfig;
use crate::constants::cleanup;
use crate::crypto::TokenCipher;
use crate::idp::IdentityProvider;
use crate::ratelimit::RateLimiter;
use crate::store::AuthStore;

/// Everything a request handler needs, shared via `Arc`.
pub struct ServerContext {
    /// Gateway configuration.
    pub config: Arc<ServerConfig>,
    /// The in-memory authorization store.
    pub store: Arc<AuthStore>,
    /// Upstream identity provider.
    pub idp: Arc<dyn IdentityProvider>,
    /// Audit event sink.
    pub audit: Arc<AuditLogger>,
    /// Per-IP limiter, applied as the outermost request layer.
    pub ip_limiter: Arc<RateLimiter>,
    /// Per-user limiter, applied after authentication.
    pub user_limiter: Arc<RateLimiter>,
}

impl ServerContext {
    /// Assemble a context from configuration and a provider implementation.
    #[must_use]
    pub fn new(config: ServerConfig, idp: Arc<dyn IdentityProvider>) -> Arc<Self> {
        let cipher = TokenCipher::new(config.encryption_key);
        let store = Arc::new(AuthStore::new(cipher));
        let audit = Arc::new(AuditLogger::new(config.enable_audit_logging));
        let ip_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.rate,
            config.rate_limit.burst,
        ));
        let user_limiter = Arc::new(RateLimiter::new(
            config.rate_limit.user_rate,
            config.rate_limit.user_burst,
        ));

        Arc::new(Self {
            config: Arc::new(config),
            store,
            idp,
            audit,
            ip_limiter,
            user_limiter,
        })
    }

    /// Start the background sweep loops.
    pub fn start_background_tasks(self: &Arc<Self>) {
        self.store.start_sweeper(self.config.sweep_interval());
        let interval = Duration::from_secs(cleanup::LIMITER_SWEEP_INTERVAL_SECS);
        let idle = Duration::from_secs(cleanup::BUCKET_IDLE_EVICT_SECS);
        self.ip_limiter.start_sweeper(interval, idle);
        self.user_limiter.start_sweeper(interval, idle);
    }

    /// Stop all background work. Idempotent; safe under concurrent callers.
    pub async fn shutdown(&self) {
        self.store.stop().await;
        self.ip_limiter.stop().await;
        self.user_limiter.stop().await;
    }
}

impl std::fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerContext")
            .field("issuer", &self.config.issuer())
            .finish_non_exhaustive()
    }
}
