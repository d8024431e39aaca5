// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC servers for croupier-edge.
//!
//! Two listeners: the tunnel plane agents dial in on, and the function plane
//! that relays operator traffic toward agents.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use croupier_core::pool::{ConnectionPool, PoolConfig, QuicDialer};
use croupier_core::router::QuicTransport;
use croupier_proto::frame::Frame;
use croupier_proto::function;
use croupier_proto::server::{
    ConnectionHandler, CroupierServer, CroupierServerConfig, StreamHandler,
};

use crate::config::Config;
use crate::relay::FunctionRelay;
use crate::tunnel::TunnelServer;

/// Everything the two listeners share, assembled from configuration.
pub struct Edge {
    pub config: Config,
    pub tunnel: Arc<TunnelServer>,
    pub relay: Arc<FunctionRelay<QuicTransport>>,
    pub pool: Arc<ConnectionPool<QuicDialer>>,
}

/// Build the shared state: the tunnel server and the relay over a pooled
/// direct-dial transport.
pub fn build(config: Config) -> Result<Edge> {
    let dialer = match &config.agent_ca_path {
        Some(path) => {
            let ca_pem = std::fs::read(path)
                .with_context(|| format!("reading agent CA bundle {}", path.display()))?;
            QuicDialer::new(ca_pem, Vec::new(), Vec::new())
        }
        None => {
            warn!("no agent CA configured, dialing agents without verification");
            QuicDialer::insecure()
        }
    };
    let pool = Arc::new(ConnectionPool::new(dialer, PoolConfig::default()));
    let transport = Arc::new(QuicTransport::new(pool.clone()));
    let tunnel = Arc::new(TunnelServer::new());
    let relay = Arc::new(FunctionRelay::new(
        tunnel.clone(),
        transport,
        config.fallback_addrs.clone(),
    ));
    Ok(Edge {
        config,
        tunnel,
        relay,
        pool,
    })
}

/// Bind a listener, using configured TLS material or a self-signed dev cert.
pub fn bind_server(config: &Config, bind_addr: SocketAddr) -> Result<CroupierServer> {
    let mut server_config = CroupierServerConfig::from_env();
    server_config.bind_addr = bind_addr;
    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            server_config.cert_pem = std::fs::read(cert_path)
                .with_context(|| format!("reading TLS cert {}", cert_path.display()))?;
            server_config.key_pem = std::fs::read(key_path)
                .with_context(|| format!("reading TLS key {}", key_path.display()))?;
            Ok(CroupierServer::new(server_config)?)
        }
        _ => Ok(CroupierServer::localhost_with_config(
            bind_addr,
            server_config,
        )?),
    }
}

/// Run the tunnel QUIC server. Every accepted stream is one tunnel attempt.
#[instrument(skip(server, tunnel))]
pub async fn run_tunnel_server(server: CroupierServer, tunnel: Arc<TunnelServer>) -> Result<()> {
    info!(addr = %server.local_addr()?, "tunnel server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let tunnel = tunnel.clone();
            async move {
                debug!(remote = %conn.remote_address(), "tunnel connection accepted");
                conn.run(move |stream: StreamHandler| {
                    let tunnel = tunnel.clone();
                    async move {
                        tunnel.serve(stream).await;
                    }
                })
                .await;
            }
        })
        .await?;
    Ok(())
}

/// Run the function-plane QUIC server.
#[instrument(skip(server, relay))]
pub async fn run_function_server(
    server: CroupierServer,
    relay: Arc<FunctionRelay<QuicTransport>>,
) -> Result<()> {
    info!(addr = %server.local_addr()?, "function-plane server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let relay = relay.clone();
            async move {
                debug!(remote = %conn.remote_address(), "function connection accepted");
                conn.run(move |stream: StreamHandler| {
                    let relay = relay.clone();
                    async move {
                        if let Err(e) = handle_function_stream(stream, relay).await {
                            error!("function stream error: {}", e);
                        }
                    }
                })
                .await;
            }
        })
        .await?;
    Ok(())
}

/// One function-plane exchange. `StreamJob` answers with a frame sequence;
/// everything else is a single response frame.
async fn handle_function_stream(
    mut stream: StreamHandler,
    relay: Arc<FunctionRelay<QuicTransport>>,
) -> Result<()> {
    let frame = stream.read_frame().await?;
    let request: function::RpcRequest = frame.decode()?;

    if let Some(function::rpc_request::Request::StreamJob(req)) = &request.request {
        match relay.stream_job(&req.job_id).await {
            Ok(mut events) => {
                stream.write_frame(&Frame::stream_start()).await?;
                while let Some(event) = events.recv().await {
                    stream.write_frame(&Frame::stream_data(&event)?).await?;
                }
                stream.write_frame(&Frame::stream_end()).await?;
            }
            Err(err) => {
                stream
                    .write_frame(&Frame::error(&err.to_rpc_error())?)
                    .await?;
            }
        }
        stream.finish()?;
        return Ok(());
    }

    let response = relay.handle(request).await;
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}
