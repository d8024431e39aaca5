// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC servers for croupier-core.
//!
//! Two listeners: the control plane (agent registration, heartbeats,
//! assignment polling) and the function plane (invocations and job
//! operations). In edge-forward mode the function plane relays to the edge
//! gateway instead of routing.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};

use croupier_proto::frame::Frame;
use croupier_proto::server::{
    ConnectionHandler, CroupierServer, CroupierServerConfig, StreamHandler,
};
use croupier_proto::{control, function};

use crate::approvals::ApprovalStore;
use crate::assignments::AssignmentStore;
use crate::audit::AuditWriter;
use crate::balancer;
use crate::config::Config;
use crate::descriptor::DescriptorStore;
use crate::forward::EdgeForwarder;
use crate::games::GameStore;
use crate::handlers::{ControlHandler, FunctionHandler};
use crate::limiter::RateLimiter;
use crate::policy::{Policy, UnifiedPolicyEngine};
use crate::pool::{ConnectionPool, PoolConfig, QuicDialer};
use crate::registry::Registry;
use crate::router::{AgentTransport, QuicTransport, Router};
use crate::stats::{HealthChecker, StatsCollector};

/// Function-plane personality: route to agents, or relay to the edge.
pub enum FunctionPlane<T: AgentTransport> {
    Route(Arc<FunctionHandler<T>>),
    Forward(Arc<EdgeForwarder<T>>),
}

impl<T: AgentTransport> Clone for FunctionPlane<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Route(handler) => Self::Route(handler.clone()),
            Self::Forward(fwd) => Self::Forward(fwd.clone()),
        }
    }
}

impl<T: AgentTransport> FunctionPlane<T> {
    async fn handle(&self, request: function::RpcRequest) -> function::RpcResponse {
        match self {
            Self::Route(handler) => handler.handle(request).await,
            Self::Forward(fwd) => fwd.forward(request).await,
        }
    }

    async fn stream_job(
        &self,
        job_id: &str,
    ) -> crate::error::Result<tokio::sync::mpsc::Receiver<function::JobEvent>> {
        match self {
            Self::Route(handler) => handler.stream_job(job_id).await,
            Self::Forward(fwd) => fwd.stream_job(job_id).await,
        }
    }
}

/// Everything the two listeners share, assembled from configuration.
pub struct Core {
    pub config: Config,
    pub control: Arc<ControlHandler>,
    pub function: FunctionPlane<QuicTransport>,
    pub pool: Arc<ConnectionPool<QuicDialer>>,
    pub registry: Arc<Registry>,
    pub limiter: Arc<RateLimiter>,
    pub approvals: Arc<ApprovalStore>,
}

/// Build the shared state: load the descriptor pack and policy, open the
/// audit log, and wire the router behind the chosen balancer.
pub fn build(config: Config) -> Result<Core> {
    let descriptors = Arc::new(DescriptorStore::new());
    let loaded = descriptors
        .load_dir(&config.pack_dir)
        .with_context(|| format!("loading descriptor pack from {}", config.pack_dir.display()))?;
    info!(count = loaded, dir = %config.pack_dir.display(), "descriptor pack loaded");

    let policy = match &config.policy_path {
        Some(path) => Policy::load_file(path)
            .with_context(|| format!("loading policy from {}", path.display()))?,
        None => Policy::new(),
    };
    let engine = Arc::new(UnifiedPolicyEngine::new(policy));

    let audit = Arc::new(
        AuditWriter::open(&config.audit_path)
            .with_context(|| format!("opening audit log at {}", config.audit_path.display()))?,
    );

    let registry = Arc::new(Registry::new());
    let games = Arc::new(GameStore::new());
    let assignments = Arc::new(AssignmentStore::new());
    let approvals = Arc::new(ApprovalStore::new());
    let stats = Arc::new(StatsCollector::new());
    let health = Arc::new(HealthChecker::new());
    let limiter = Arc::new(RateLimiter::new());
    let balancer = balancer::from_name(&config.balancer, health.clone(), stats.clone())?;

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
    let router = Arc::new(Router::new(
        transport.clone(),
        registry.clone(),
        balancer,
        stats,
        health.clone(),
        limiter.clone(),
    ));

    let control = Arc::new(ControlHandler::new(
        registry.clone(),
        games,
        assignments.clone(),
        health,
    ));
    let function = match config.edge_addr {
        Some(edge_addr) => {
            info!(%edge_addr, "edge-forward mode, function plane relays to the edge");
            FunctionPlane::Forward(Arc::new(EdgeForwarder::new(
                transport,
                edge_addr.to_string(),
            )))
        }
        None => FunctionPlane::Route(Arc::new(FunctionHandler::new(
            descriptors,
            assignments,
            engine,
            approvals.clone(),
            audit,
            router,
        ))),
    };

    Ok(Core {
        config,
        control,
        function,
        pool,
        registry,
        limiter,
        approvals,
    })
}

/// Bind a listener, using configured TLS material or a self-signed dev cert.
pub fn bind_server(config: &Config, bind_addr: SocketAddr, mtls: bool) -> Result<CroupierServer> {
    let mut server_config = CroupierServerConfig::from_env();
    server_config.bind_addr = bind_addr;
    if mtls && let Some(ca_path) = &config.client_ca_path {
        server_config.client_ca_pem = std::fs::read(ca_path)
            .with_context(|| format!("reading client CA bundle {}", ca_path.display()))?;
    }
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

/// Run the control-plane QUIC server.
#[instrument(skip(server, handler))]
pub async fn run_control_server(
    server: CroupierServer,
    handler: Arc<ControlHandler>,
) -> Result<()> {
    info!(addr = %server.local_addr()?, "control-plane server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let handler = handler.clone();
            async move {
                handle_control_connection(conn, handler).await;
            }
        })
        .await?;
    Ok(())
}

async fn handle_control_connection(conn: ConnectionHandler, handler: Arc<ControlHandler>) {
    debug!(remote = %conn.remote_address(), "control connection accepted");
    conn.run(move |stream: StreamHandler| {
        let handler = handler.clone();
        async move {
            if let Err(e) = handle_control_stream(stream, handler).await {
                error!("control stream error: {}", e);
            }
        }
    })
    .await;
}

async fn handle_control_stream(
    mut stream: StreamHandler,
    handler: Arc<ControlHandler>,
) -> Result<()> {
    let frame = stream.read_frame().await?;
    let request: control::RpcRequest = frame.decode()?;
    let response = handler.handle(request);
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}

/// Run the function-plane QUIC server.
#[instrument(skip(server, plane))]
pub async fn run_function_server(
    server: CroupierServer,
    plane: FunctionPlane<QuicTransport>,
) -> Result<()> {
    info!(addr = %server.local_addr()?, "function-plane server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let plane = plane.clone();
            async move {
                handle_function_connection(conn, plane).await;
            }
        })
        .await?;
    Ok(())
}

async fn handle_function_connection<T: AgentTransport>(
    conn: ConnectionHandler,
    plane: FunctionPlane<T>,
) {
    debug!(remote = %conn.remote_address(), "function connection accepted");
    conn.run(move |stream: StreamHandler| {
        let plane = plane.clone();
        async move {
            if let Err(e) = handle_function_stream(stream, plane).await {
                error!("function stream error: {}", e);
            }
        }
    })
    .await;
}

/// One function-plane exchange. `StreamJob` answers with a frame sequence;
/// everything else is a single response frame.
async fn handle_function_stream<T: AgentTransport>(
    mut stream: StreamHandler,
    plane: FunctionPlane<T>,
) -> Result<()> {
    let frame = stream.read_frame().await?;
    let request: function::RpcRequest = frame.decode()?;

    if let Some(function::rpc_request::Request::StreamJob(req)) = &request.request {
        match plane.stream_job(&req.job_id).await {
            Ok(mut events) => {
                stream.write_frame(&Frame::stream_start()).await?;
                while let Some(event) = events.recv().await {
                    stream.write_frame(&Frame::stream_data(&event)?).await?;
                }
                stream.write_frame(&Frame::stream_end()).await?;
            }
            Err(err) => {
                stream.write_frame(&Frame::error(&err.to_rpc_error())?).await?;
            }
        }
        stream.finish()?;
        return Ok(());
    }

    let response = plane.handle(request).await;
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use croupier_proto::CroupierClient;

    use crate::games::GameStore;

    async fn spawn_control_server() -> (SocketAddr, Arc<Registry>) {
        let registry = Arc::new(Registry::new());
        let handler = Arc::new(ControlHandler::new(
            registry.clone(),
            Arc::new(GameStore::new()),
            Arc::new(AssignmentStore::new()),
            Arc::new(HealthChecker::new()),
        ));
        let server = CroupierServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = run_control_server(server, handler).await;
        });
        (addr, registry)
    }

    #[tokio::test]
    async fn test_register_and_heartbeat_over_quic() {
        let (addr, registry) = spawn_control_server().await;

        let client = CroupierClient::localhost(addr).unwrap();
        client.connect().await.unwrap();

        let register = control::RpcRequest {
            request: Some(control::rpc_request::Request::Register(
                control::RegisterRequest {
                    agent_id: "agent-1".to_string(),
                    version: "0.3.0".to_string(),
                    rpc_addr: "127.0.0.1:7301".to_string(),
                    game_id: "poker".to_string(),
                    env: "prod".to_string(),
                    region: String::new(),
                    zone: String::new(),
                    labels: HashMap::new(),
                    functions: vec![control::FunctionSpec {
                        id: "table.close".to_string(),
                        entity: "table".to_string(),
                        operation: "close".to_string(),
                        enabled: true,
                    }],
                },
            )),
        };
        let response: control::RpcResponse = client.request(&register).await.unwrap();
        let session_id = match response.response {
            Some(control::rpc_response::Response::Register(r)) => r.session_id,
            other => panic!("expected register response, got {:?}", other),
        };
        assert!(registry.get("agent-1").is_some());

        let heartbeat = control::RpcRequest {
            request: Some(control::rpc_request::Request::Heartbeat(
                control::HeartbeatRequest {
                    agent_id: "agent-1".to_string(),
                    session_id,
                },
            )),
        };
        let response: control::RpcResponse = client.request(&heartbeat).await.unwrap();
        assert!(matches!(
            response.response,
            Some(control::rpc_response::Response::Heartbeat(_))
        ));

        client.close().await;
    }
}
