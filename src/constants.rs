// ABOUTME: Application constants for token lifetimes, store limits, and protocol values
// ABOUTME: Central place for tunable defaults shared across the authorization engine
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Shared constants for the authorization gateway.

/// Lifetimes and freshness thresholds.
pub mod lifetimes {
    /// Authorization codes are single-use and expire after 10 minutes.
    pub const AUTH_CODE_TTL_SECS: i64 = 600;

    /// Pending authorization flow state expires after 10 minutes.
    pub const FLOW_STATE_TTL_SECS: i64 = 600;

    /// Server-issued bearer tokens are valid for one hour.
    pub const ACCESS_TOKEN_TTL_SECS: i64 = 3600;

    /// Default refresh token lifetime when not configured.
    pub const REFRESH_TOKEN_TTL_DAYS: i64 = 90;

    /// Upstream tokens with less remaining lifetime than this are refreshed
    /// before an authorization code grant completes.
    pub const UPSTREAM_REFRESH_SKEW_SECS: i64 = 60;

    /// The resource middleware refreshes upstream tokens expiring within
    /// this window.
    pub const MIDDLEWARE_REFRESH_THRESHOLD_SECS: i64 = 300;

    /// Forwarded access tokens without an explicit expiry header are assumed
    /// valid for one hour.
    pub const FORWARDED_TOKEN_TTL_SECS: i64 = 3600;

    /// Retired refresh tokens are kept this long for reuse detection.
    pub const ROTATED_REFRESH_RETENTION_SECS: i64 = 86_400;
}

/// Sizes of generated token material, in raw bytes before base64url encoding.
pub mod tokens {
    /// Authorization code entropy.
    pub const AUTH_CODE_BYTES: usize = 32;

    /// Upstream state token entropy.
    pub const STATE_BYTES: usize = 32;

    /// Server access token entropy.
    pub const ACCESS_TOKEN_BYTES: usize = 48;

    /// Refresh token entropy.
    pub const REFRESH_TOKEN_BYTES: usize = 48;

    /// Client secret entropy for confidential clients.
    pub const CLIENT_SECRET_BYTES: usize = 32;
}

/// Background sweep cadence and eviction thresholds.
pub mod cleanup {
    /// Store TTL sweep interval.
    pub const STORE_SWEEP_INTERVAL_SECS: u64 = 300;

    /// Rate limiter bucket sweep interval.
    pub const LIMITER_SWEEP_INTERVAL_SECS: u64 = 300;

    /// Buckets untouched for this long are evicted by the sweep.
    pub const BUCKET_IDLE_EVICT_SECS: u64 = 600;

    /// Upper bound on deletions per sweep pass so writers are not starved.
    pub const SWEEP_BATCH_LIMIT: usize = 1024;
}

/// Request validation limits.
pub mod limits {
    /// Default cap on active client registrations per source IP.
    pub const MAX_CLIENTS_PER_IP: u32 = 10;

    /// PKCE code verifier minimum length (RFC 7636 section 4.1).
    pub const PKCE_VERIFIER_MIN_LEN: usize = 43;

    /// PKCE code verifier maximum length (RFC 7636 section 4.1).
    pub const PKCE_VERIFIER_MAX_LEN: usize = 128;
}

/// Header names recognized by the middleware stack.
pub mod headers {
    /// Proxy-appended client address chain.
    pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

    /// Single client address written by a trusted reverse proxy.
    pub const X_REAL_IP: &str = "x-real-ip";

    /// Pre-validated upstream access token forwarded by an SSO aggregator.
    pub const SSO_ACCESS_TOKEN: &str = "x-google-access-token";

    /// Optional upstream refresh token accompanying the forwarded access token.
    pub const SSO_REFRESH_TOKEN: &str = "x-google-refresh-token";

    /// Optional RFC 3339 expiry for the forwarded access token.
    pub const SSO_TOKEN_EXPIRY: &str = "x-google-token-expiry";

    /// Pre-shared registration access token for closed registration mode.
    pub const REGISTRATION_ACCESS_TOKEN: &str = "x-registration-access-token";
}

/// Default upstream identity provider endpoints (Google).
pub mod google {
    /// Authorization endpoint shown to the resource owner.
    pub const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

    /// Token endpoint for code exchange and refresh.
    pub const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

    /// Userinfo endpoint used for bearer validation.
    pub const USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

    /// Scopes requested when none are configured.
    pub const DEFAULT_SCOPES: &[&str] = &["openid", "email", "profile"];
}

/// Outbound HTTP client tuning for the identity provider.
pub mod upstream_http {
    /// Per-call timeout in seconds.
    pub const TIMEOUT_SECS: u64 = 30;

    /// Bounded idle connection pool per host.
    pub const POOL_MAX_IDLE_PER_HOST: usize = 8;
}
