// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier core server.
//!
//! Runs the control plane (agent registration, heartbeats, assignments) and
//! the function plane (invocations and jobs) as two QUIC listeners over
//! shared state.

use anyhow::Result;
use tracing::{error, info};

use croupier_core::config::Config;
use croupier_core::server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("croupier_core=info".parse().unwrap()),
        )
        .init();

    info!("Starting Croupier core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;
    info!(
        control_addr = %config.control_addr,
        function_addr = %config.function_addr,
        pack_dir = %config.pack_dir.display(),
        balancer = %config.balancer,
        forward_mode = config.edge_addr.is_some(),
        "Configuration loaded"
    );

    let core = server::build(config)?;

    let control_server = server::bind_server(&core.config, core.config.control_addr, false)?;
    let function_server = server::bind_server(&core.config, core.config.function_addr, true)?;

    let pool = core.pool.clone();
    let maintenance_handle = tokio::spawn(async move {
        pool.run_maintenance().await;
    });

    let control_handler = core.control.clone();
    let control_handle = tokio::spawn(async move {
        if let Err(e) = server::run_control_server(control_server, control_handler).await {
            error!("Control-plane server error: {}", e);
        }
    });

    let function_plane = core.function.clone();
    let function_handle = tokio::spawn(async move {
        if let Err(e) = server::run_function_server(function_server, function_plane).await {
            error!("Function-plane server error: {}", e);
        }
    });

    info!("Croupier core running");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    control_handle.abort();
    function_handle.abort();
    maintenance_handle.abort();
    core.pool.close().await;

    info!("Shutdown complete");
    Ok(())
}
