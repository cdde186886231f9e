// ABOUTME: Server binary: loads configuration, wires the context, serves the router
// ABOUTME: Handles graceful shutdown and background task teardown
//
// Licensed under either of Apache License, Version 2.0 or MIT License at your option.
// Copyright ©2025 Async-IO.org

//! Gateway server binary.

#![allow(clippy::print_stderr)]

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use mcp_oauth_gateway::config::ServerConfig;
use mcp_oauth_gateway::context::ServerContext;
use mcp_oauth_gateway::idp::GoogleProvider;
use mcp_oauth_gateway::logging::LoggingConfig;
use mcp_oauth_gateway::oauth2;

#[derive(Debug, Parser)]
#[command(name = "mcp-oauth-gateway", version, about = "OAuth 2.1 authorization gateway for MCP clients")]
struct Args {
    /// Override the bind address from the environment configuration.
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    LoggingConfig::from_env().init()?;

    let mut config = ServerConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let bind_addr: SocketAddr = config
        .bind_addr
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.bind_addr))?;

    let provider = Arc::new(GoogleProvider::new(&config.idp)?);
    let ctx = ServerContext::new(config, provider);
    ctx.start_background_tasks();

    let app = oauth2::router(ctx.clone())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(TimeoutLayer::new(std::time::Duration::from_secs(30)));

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, issuer = ctx.config.issuer(), "gateway listening");

    let shutdown_ctx = ctx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown_ctx.shutdown().await;
    })
    .await
    .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
