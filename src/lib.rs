// ABOUTME: Library entry point for the OAuth 2.1 authorization gateway
// ABOUTME: Fronts an upstream identity provider on behalf of MCP clients
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright ©2025 Async-IO.org

#![deny(unsafe_code)]

//! # MCP OAuth Gateway
//!
//! An OAuth 2.1 authorization and resource server that fronts an upstream
//! identity provider (e.g. Google) on behalf of downstream Model Context
//! Protocol clients. Clients never see the provider's credentials: they
//! register dynamically, run the authorization-code flow with mandatory
//! PKCE, and receive opaque bearer tokens whose lifecycle and audience this
//! server controls.
//!
//! ## Architecture
//!
//! - **`oauth2`** — the authorization engine: registration, authorize,
//!   callback, token exchange with refresh rotation, and revocation.
//! - **`store`** — concurrent in-memory state with TTL sweeping and
//!   AES-256-GCM sealing of upstream token material.
//! - **`middleware`** — bearer validation for protected resources, SSO
//!   token forwarding, and rate limiting.
//! - **`idp`** — the provider trait and the Google-shaped HTTP client.
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcp_oauth_gateway::config::ServerConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = ServerConfig::from_env()?;
//!     println!("gateway will bind {}", config.bind_addr);
//!     Ok(())
//! }
//! ```

/// Structured security audit logging.
pub mod audit;

/// Environment configuration management.
pub mod config;

/// Application constants and tunable defaults.
pub mod constants;

/// Shared dependency bundle for handlers and middleware.
pub mod context;

/// Cryptographic utilities: token generation, sealing, secret hashing.
pub mod crypto;

/// OAuth error taxonomy and the JSON error envelope.
pub mod errors;

/// Upstream identity provider client.
pub mod idp;

/// Logging configuration and subscriber setup.
pub mod logging;

/// Resource-server middleware: bearer validation, SSO forwarding, limits.
pub mod middleware;

/// Core data entities.
pub mod models;

/// The OAuth 2.1 authorization server.
pub mod oauth2;

/// Token-bucket rate limiting.
pub mod ratelimit;

/// Redirect-URI security policy.
pub mod redirect;

/// Silent-authentication (`prompt=none`) helpers.
pub mod silent;

/// Concurrent in-memory stores.
pub mod store;
