// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier agent.
//!
//! Runs next to a game fleet: serves the function plane, accepts local SDK
//! registrations, and keeps a control-plane session and an edge tunnel alive
//! when those upstreams are configured.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use croupier_agent::config::Config;
use croupier_agent::control::ControlClient;
use croupier_agent::server;
use croupier_agent::tunnel::TunnelClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("croupier_agent=info".parse().unwrap()),
        )
        .init();

    info!("Starting Croupier agent");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        agent_id = %config.agent_id,
        game_id = %config.game_id,
        env = %config.env,
        rpc_addr = %config.rpc_addr,
        local_addr = %config.local_addr,
        "Configuration loaded"
    );

    let ca_pem = match &config.ca_path {
        Some(path) => std::fs::read(path).map_err(|e| {
            error!("Failed to read CA bundle {}: {}", path.display(), e);
            e
        })?,
        None => Vec::new(),
    };

    let agent = Arc::new(server::build(config)?);

    let function_server = server::bind_server(&agent.config, agent.config.rpc_addr)?;
    let local_server = server::bind_server(&agent.config, agent.config.local_addr)?;

    let pool = agent.pool.clone();
    let maintenance_handle = tokio::spawn(async move {
        pool.run_maintenance().await;
    });

    let function_agent = agent.clone();
    let function_handle = tokio::spawn(async move {
        if let Err(e) = server::run_function_server(function_server, function_agent).await {
            error!("Function-plane server error: {}", e);
        }
    });

    let local_agent = agent.clone();
    let local_handle = tokio::spawn(async move {
        if let Err(e) = server::run_local_server(local_server, local_agent).await {
            error!("Local-plane server error: {}", e);
        }
    });

    let control_handle = match agent.config.control_addr {
        Some(control_addr) => {
            let control = Arc::new(ControlClient::new(
                &agent.config,
                control_addr,
                ca_pem.clone(),
                agent.registry.clone(),
            )?);
            info!(addr = %control_addr, "control-plane client starting");
            Some(tokio::spawn(control.run()))
        }
        None => {
            info!("no control plane configured, skipping registration");
            None
        }
    };

    let tunnel_handle = match agent.config.tunnel_addr {
        Some(tunnel_addr) => {
            let tunnel = Arc::new(TunnelClient::new(
                &agent.config,
                tunnel_addr,
                ca_pem,
                agent.dispatch.clone(),
                agent.executor.clone(),
                agent.registry.clone(),
            ));
            info!(addr = %tunnel_addr, "tunnel client starting");
            Some(tokio::spawn(tunnel.run()))
        }
        None => {
            info!("no edge tunnel configured, serving direct dials only");
            None
        }
    };

    info!("Croupier agent running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    function_handle.abort();
    local_handle.abort();
    maintenance_handle.abort();
    if let Some(handle) = control_handle {
        handle.abort();
    }
    if let Some(handle) = tunnel_handle {
        handle.abort();
    }
    agent.pool.close().await;

    info!("Shutdown complete");
    Ok(())
}
