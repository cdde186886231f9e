// ABOUTME: Request middleware for bearer validation, SSO forwarding, and rate limits
// ABOUTME: Wraps arbitrary downstream handlers with the resource-server pipeline
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Resource-server middleware.

pub mod auth;
pub mod rate_limiting;
pub mod sso;

pub use auth::{optional_bearer, require_bearer, RequestUser};
pub use rate_limiting::ip_rate_limit;
pub use sso::sso_access_token;
