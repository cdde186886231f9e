// ABOUTME: OAuth 2.1 authorization server module: engine, registration, routes
// ABOUTME: Fronts the upstream identity provider on behalf of MCP clients
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! OAuth 2.1 authorization server.

pub mod endpoints;
pub mod models;
pub mod registration;
pub mod routes;

pub use endpoints::{AuthorizationServer, BasicCredentials};
pub use models::{
    AuthorizationServerMetadata, AuthorizeRequest, ClientRegistrationRequest,
    ClientRegistrationResponse, ProtectedResourceMetadata, RevokeRequest, TokenRequest,
    TokenResponse,
};
pub use registration::ClientRegistrar;
pub use routes::router;
