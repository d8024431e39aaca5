// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier edge server.
//!
//! Runs the tunnel listener agents dial in on and the function plane that
//! relays operator traffic over those tunnels.

use anyhow::Result;
use tracing::{error, info};

use croupier_edge::config::Config;
use croupier_edge::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("croupier_edge=info".parse().unwrap()),
        )
        .init();

    info!("Starting Croupier edge");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        function_addr = %config.function_addr,
        tunnel_addr = %config.tunnel_addr,
        fallback_agents = config.fallback_addrs.len(),
        "Configuration loaded"
    );

    let edge = server::build(config)?;

    let tunnel_server = server::bind_server(&edge.config, edge.config.tunnel_addr)?;
    let function_server = server::bind_server(&edge.config, edge.config.function_addr)?;

    let pool = edge.pool.clone();
    let maintenance_handle = tokio::spawn(async move {
        pool.run_maintenance().await;
    });

    let tunnel = edge.tunnel.clone();
    let tunnel_handle = tokio::spawn(async move {
        if let Err(e) = server::run_tunnel_server(tunnel_server, tunnel).await {
            error!("Tunnel server error: {}", e);
        }
    });

    let relay = edge.relay.clone();
    let function_handle = tokio::spawn(async move {
        if let Err(e) = server::run_function_server(function_server, relay).await {
            error!("Function-plane server error: {}", e);
        }
    });

    info!("Croupier edge running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    tunnel_handle.abort();
    function_handle.abort();
    maintenance_handle.abort();
    edge.pool.close().await;

    info!("Shutdown complete");
    Ok(())
}
