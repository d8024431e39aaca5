// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! QUIC servers for croupier-agent.
//!
//! Two listeners: the function plane the edge and core dial directly, and
//! the loopback local plane where co-located game services register their
//! function endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument};

use croupier_core::pool::{ConnectionPool, PoolConfig, QuicDialer};
use croupier_proto::frame::Frame;
use croupier_proto::function::{self, JobEvent, JobEventType, JobState};
use croupier_proto::local;
use croupier_proto::server::{
    ConnectionHandler, CroupierServer, CroupierServerConfig, StreamHandler,
};

use crate::config::Config;
use crate::dispatch::{LocalDispatch, QuicLocalDispatch};
use crate::error::AgentError;
use crate::executor::{JobExecutor, JobSnapshot};
use crate::local::LocalRegistry;

/// Everything the listeners share, assembled from configuration.
pub struct Agent {
    pub config: Config,
    pub registry: Arc<LocalRegistry>,
    pub dispatch: Arc<QuicLocalDispatch>,
    pub executor: Arc<JobExecutor<QuicLocalDispatch>>,
    pub pool: Arc<ConnectionPool<QuicDialer>>,
}

/// Build the shared state: the local registry and an executor dispatching
/// over pooled QUIC.
pub fn build(config: Config) -> Result<Agent> {
    let registry = Arc::new(LocalRegistry::new());
    // SDK endpoints sit on loopback and present self-signed certs
    let pool = Arc::new(ConnectionPool::new(
        QuicDialer::insecure(),
        PoolConfig::default(),
    ));
    let dispatch = Arc::new(QuicLocalDispatch::new(registry.clone(), pool.clone()));
    let executor = Arc::new(JobExecutor::new(dispatch.clone()));
    Ok(Agent {
        config,
        registry,
        dispatch,
        executor,
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

/// Run the function-plane QUIC server the edge and core dial directly.
#[instrument(skip(server, agent))]
pub async fn run_function_server(server: CroupierServer, agent: Arc<Agent>) -> Result<()> {
    info!(addr = %server.local_addr()?, "function-plane server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let agent = agent.clone();
            async move {
                debug!(remote = %conn.remote_address(), "function connection accepted");
                conn.run(move |stream: StreamHandler| {
                    let agent = agent.clone();
                    async move {
                        if let Err(e) = handle_function_stream(stream, agent).await {
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

/// Run the loopback local-plane server game services register with.
#[instrument(skip(server, agent))]
pub async fn run_local_server(server: CroupierServer, agent: Arc<Agent>) -> Result<()> {
    info!(addr = %server.local_addr()?, "local-plane server starting");
    server
        .run(move |conn: ConnectionHandler| {
            let agent = agent.clone();
            async move {
                conn.run(move |stream: StreamHandler| {
                    let agent = agent.clone();
                    async move {
                        if let Err(e) = handle_local_stream(stream, agent).await {
                            error!("local stream error: {}", e);
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
async fn handle_function_stream(mut stream: StreamHandler, agent: Arc<Agent>) -> Result<()> {
    let frame = stream.read_frame().await?;
    let request: function::RpcRequest = frame.decode()?;

    if let Some(function::rpc_request::Request::StreamJob(req)) = &request.request {
        stream_job(&mut stream, &agent, &req.job_id).await?;
        stream.finish()?;
        return Ok(());
    }

    let response = handle_function_request(&agent, request).await;
    stream.write_frame(&Frame::response(&response)?).await?;
    stream.finish()?;
    Ok(())
}

async fn stream_job(stream: &mut StreamHandler, agent: &Agent, job_id: &str) -> Result<()> {
    if let Some(mut events) = agent.executor.subscribe(job_id) {
        stream.write_frame(&Frame::stream_start()).await?;
        while let Some(event) = events.recv().await {
            stream.write_frame(&Frame::stream_data(&event)?).await?;
        }
        stream.write_frame(&Frame::stream_end()).await?;
        return Ok(());
    }
    let snapshot = agent.executor.snapshot(job_id);
    if snapshot.state == JobState::Unknown {
        let err = AgentError::UnknownJob(job_id.to_string());
        stream.write_frame(&Frame::error(&err.to_rpc_error())?).await?;
        return Ok(());
    }
    // finished while nobody watched: replay the terminal outcome as one event
    stream.write_frame(&Frame::stream_start()).await?;
    stream
        .write_frame(&Frame::stream_data(&terminal_event(&snapshot))?)
        .await?;
    stream.write_frame(&Frame::stream_end()).await?;
    Ok(())
}

fn terminal_event(snapshot: &JobSnapshot) -> JobEvent {
    JobEvent {
        r#type: match snapshot.state {
            JobState::Done => JobEventType::Done as i32,
            _ => JobEventType::Error as i32,
        },
        progress: 100,
        message: snapshot.error.clone(),
        payload: snapshot.payload.clone(),
    }
}

async fn handle_function_request(
    agent: &Arc<Agent>,
    request: function::RpcRequest,
) -> function::RpcResponse {
    use function::{rpc_request::Request, rpc_response::Response};

    let response = match request.request {
        Some(Request::Invoke(req)) => {
            match agent
                .dispatch
                .invoke(&req.function_id, &req.payload, &req.metadata)
                .await
            {
                Ok(payload) => Response::Invoke(function::InvokeResponse {
                    payload,
                    agent_id: agent.config.agent_id.clone(),
                }),
                Err(err) => Response::Error(err.to_rpc_error()),
            }
        }
        Some(Request::StartJob(req)) => {
            let (job_id, _events) = agent.executor.start_job(&req);
            Response::StartJob(function::StartJobResponse {
                job_id,
                agent_id: agent.config.agent_id.clone(),
            })
        }
        Some(Request::CancelJob(req)) => Response::CancelJob(function::CancelJobResponse {
            cancelled: agent.executor.cancel(&req.job_id, &req.reason),
        }),
        Some(Request::GetJobResult(req)) => {
            let snapshot = agent.executor.snapshot(&req.job_id);
            Response::GetJobResult(function::GetJobResultResponse {
                state: snapshot.state as i32,
                payload: snapshot.payload,
                error: snapshot.error,
            })
        }
        Some(Request::ListLocal(req)) => Response::ListLocal(function::ListLocalResponse {
            service_ids: agent.registry.list_local(&req.function_id),
        }),
        Some(Request::StreamJob(_)) | None => Response::Error(
            croupier_proto::common::RpcError::new("BAD_REQUEST", "empty or misrouted request"),
        ),
    };
    function::RpcResponse {
        response: Some(response),
    }
}

/// One local-plane exchange: SDK registration, heartbeat, or a query.
async fn handle_local_stream(mut stream: StreamHandler, agent: Arc<Agent>) -> Result<()> {
    use local::{rpc_request::Request, rpc_response::Response};

    let frame = stream.read_frame().await?;
    let request: local::RpcRequest = frame.decode()?;

    let response = match request.request {
        Some(Request::RegisterLocal(req)) => {
            agent.registry.register(&req);
            Response::RegisterLocal(local::RegisterLocalResponse {})
        }
        Some(Request::Heartbeat(req)) => {
            if agent.registry.heartbeat(&req.service_id) {
                Response::Heartbeat(local::LocalHeartbeatResponse {})
            } else {
                Response::Error(croupier_proto::common::RpcError::new(
                    "TARGET_NOT_FOUND",
                    format!("no registrations for service '{}'", req.service_id),
                ))
            }
        }
        Some(Request::ListLocal(req)) => Response::ListLocal(function::ListLocalResponse {
            service_ids: agent.registry.list_local(&req.function_id),
        }),
        Some(Request::GetJobResult(req)) => {
            let snapshot = agent.executor.snapshot(&req.job_id);
            Response::GetJobResult(function::GetJobResultResponse {
                state: snapshot.state as i32,
                payload: snapshot.payload,
                error: snapshot.error,
            })
        }
        None => Response::Error(croupier_proto::common::RpcError::new(
            "BAD_REQUEST",
            "empty request",
        )),
    };
    let wrapped = local::RpcResponse {
        response: Some(response),
    };
    stream.write_frame(&Frame::response(&wrapped)?).await?;
    stream.finish()?;
    Ok(())
}
