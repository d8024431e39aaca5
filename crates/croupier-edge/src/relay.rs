// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function/job relay: the edge's function plane.
//!
//! Every inbound call picks an agent and rides the tunnel when one is live.
//! When the chosen agent has no tunnel the relay falls back to the legacy
//! path and dials the agent's advertised `rpc_addr` directly. Jobs started
//! on the direct path keep their own route map, mirroring the tunnel's
//! job→agent pinning.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use croupier_core::error::{CoreError, Result};
use croupier_core::router::AgentTransport;
use croupier_proto::function::{
    CancelJobRequest, CancelJobResponse, GetJobResultRequest, GetJobResultResponse, InvokeRequest,
    InvokeResponse, JobEvent, JobEventType, JobState, ListLocalRequest, ListLocalResponse,
    RpcRequest, RpcResponse, StartJobResponse, rpc_request, rpc_response,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::tunnel::{TerminalResult, TunnelServer};

/// Buffered events on a synthesized or forwarded job stream.
const JOB_EVENT_BUFFER: usize = 16;

/// Where a direct-dialed job runs.
#[derive(Debug, Clone)]
struct DirectRoute {
    agent_id: String,
    rpc_addr: String,
}

pub struct FunctionRelay<T: AgentTransport> {
    tunnel: Arc<TunnelServer>,
    transport: Arc<T>,
    /// Static agent_id → rpc_addr entries for agents that never tunneled.
    fallback_addrs: HashMap<String, String>,
    cursor: AtomicUsize,
    /// Shared with forwarding tasks, which unmap a job after relaying its
    /// terminal event.
    direct_jobs: Arc<RwLock<HashMap<String, DirectRoute>>>,
}

impl<T: AgentTransport> FunctionRelay<T> {
    pub fn new(
        tunnel: Arc<TunnelServer>,
        transport: Arc<T>,
        fallback_addrs: HashMap<String, String>,
    ) -> Self {
        Self {
            tunnel,
            transport,
            fallback_addrs,
            cursor: AtomicUsize::new(0),
            direct_jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Handle one unary function-plane request, mapping errors to the
    /// response envelope.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        let result = match request.request {
            Some(rpc_request::Request::Invoke(req)) => self
                .invoke(req)
                .await
                .map(rpc_response::Response::Invoke),
            Some(rpc_request::Request::StartJob(req)) => self
                .start_job(req)
                .await
                .map(rpc_response::Response::StartJob),
            Some(rpc_request::Request::CancelJob(req)) => self
                .cancel_job(req)
                .await
                .map(rpc_response::Response::CancelJob),
            Some(rpc_request::Request::GetJobResult(req)) => self
                .get_job_result(req)
                .await
                .map(rpc_response::Response::GetJobResult),
            Some(rpc_request::Request::ListLocal(req)) => self
                .list_local(req)
                .await
                .map(rpc_response::Response::ListLocal),
            Some(rpc_request::Request::StreamJob(_)) => Err(CoreError::BadRequest(
                "stream_job requires a streaming exchange".to_string(),
            )),
            None => Err(CoreError::BadRequest("empty request".to_string())),
        };
        match result {
            Ok(response) => RpcResponse {
                response: Some(response),
            },
            Err(err) => {
                debug!("relay error: {}", err);
                RpcResponse {
                    response: Some(rpc_response::Response::Error(err.to_rpc_error())),
                }
            }
        }
    }

    /// Pick an agent for a function call: an explicit `agent_id` metadata
    /// entry wins, otherwise round-robin over tunneled agents in the
    /// requested game scope.
    fn select_agent(
        &self,
        function_id: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<String> {
        if let Some(agent_id) = metadata.get("agent_id")
            && !agent_id.is_empty()
        {
            return Ok(agent_id.clone());
        }
        let game_id = metadata.get("game_id").map(String::as_str).unwrap_or("");
        let candidates = self.tunnel.connected_agents(game_id);
        if candidates.is_empty() {
            return Err(CoreError::NoAgentAvailable(function_id.to_string()));
        }
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Ok(candidates[idx].clone())
    }

    /// The advertised address for direct dialing, from the last hello or the
    /// static fallback table.
    fn dial_addr(&self, agent_id: &str) -> Result<String> {
        self.tunnel
            .known_addr(agent_id)
            .or_else(|| self.fallback_addrs.get(agent_id).cloned())
            .ok_or_else(|| CoreError::UpstreamUnavailable {
                agent_id: agent_id.to_string(),
                reason: "no live tunnel and no known rpc_addr".to_string(),
            })
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let agent_id = self.select_agent(&request.function_id, &request.metadata)?;

        if self.tunnel.is_connected(&agent_id) {
            let frame = self.tunnel.invoke(&agent_id, &request).await?;
            if !frame.error.is_empty() {
                return Err(CoreError::UpstreamError {
                    agent_id,
                    code: "AGENT_ERROR".to_string(),
                    message: frame.error,
                });
            }
            return Ok(InvokeResponse {
                payload: frame.payload,
                agent_id,
            });
        }

        let addr = self.dial_addr(&agent_id)?;
        debug!(agent_id = %agent_id, addr = %addr, "no tunnel, dialing agent directly");
        let response = self
            .transport
            .call(
                &agent_id,
                &addr,
                RpcRequest {
                    request: Some(rpc_request::Request::Invoke(request)),
                },
            )
            .await?;
        match response.response {
            Some(rpc_response::Response::Invoke(mut resp)) => {
                if resp.agent_id.is_empty() {
                    resp.agent_id = agent_id;
                }
                Ok(resp)
            }
            Some(rpc_response::Response::Error(err)) => Err(CoreError::UpstreamError {
                agent_id,
                code: err.code,
                message: err.message,
            }),
            _ => Err(CoreError::Internal(format!(
                "unexpected response variant from '{}'",
                agent_id
            ))),
        }
    }

    pub async fn start_job(&self, request: InvokeRequest) -> Result<StartJobResponse> {
        let agent_id = self.select_agent(&request.function_id, &request.metadata)?;

        if self.tunnel.is_connected(&agent_id) {
            let result = self.tunnel.start_job(&agent_id, &request).await?;
            if !result.error.is_empty() {
                return Err(CoreError::UpstreamError {
                    agent_id,
                    code: "AGENT_ERROR".to_string(),
                    message: result.error,
                });
            }
            return Ok(StartJobResponse {
                job_id: result.job_id,
                agent_id,
            });
        }

        let addr = self.dial_addr(&agent_id)?;
        debug!(agent_id = %agent_id, addr = %addr, "no tunnel, starting job over direct dial");
        let response = self
            .transport
            .call(
                &agent_id,
                &addr,
                RpcRequest {
                    request: Some(rpc_request::Request::StartJob(request)),
                },
            )
            .await?;
        match response.response {
            Some(rpc_response::Response::StartJob(mut resp)) => {
                if resp.agent_id.is_empty() {
                    resp.agent_id = agent_id.clone();
                }
                self.direct_jobs
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(
                        resp.job_id.clone(),
                        DirectRoute {
                            agent_id,
                            rpc_addr: addr,
                        },
                    );
                Ok(resp)
            }
            Some(rpc_response::Response::Error(err)) => Err(CoreError::UpstreamError {
                agent_id,
                code: err.code,
                message: err.message,
            }),
            _ => Err(CoreError::Internal(format!(
                "unexpected response variant from '{}'",
                agent_id
            ))),
        }
    }

    /// Subscribe to a job's event stream: live tunnel jobs fan out from the
    /// tunnel server, direct-dialed jobs stream from the agent, and finished
    /// jobs replay their cached terminal event.
    pub async fn stream_job(&self, job_id: &str) -> Result<mpsc::Receiver<JobEvent>> {
        if let Some(rx) = self.tunnel.subscribe(job_id) {
            return Ok(rx);
        }

        let direct = self
            .direct_jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned();
        if let Some(route) = direct {
            let mut upstream = self
                .transport
                .stream_job(&route.agent_id, &route.rpc_addr, job_id)
                .await?;
            let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
            let routes = self.direct_jobs.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                while let Some(event) = upstream.recv().await {
                    let terminal = event.is_terminal();
                    if tx.send(event).await.is_err() {
                        return;
                    }
                    if terminal {
                        routes
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&job_id);
                        return;
                    }
                }
            });
            return Ok(rx);
        }

        if let Some(cached) = self.tunnel.cached_result(job_id) {
            return Ok(replay_terminal(cached));
        }
        Err(CoreError::UnknownJob(job_id.to_string()))
    }

    pub async fn cancel_job(&self, request: CancelJobRequest) -> Result<CancelJobResponse> {
        if let Some(agent_id) = self.tunnel.agent_for_job(&request.job_id) {
            let result = self
                .tunnel
                .cancel_job(&agent_id, &request.job_id, &request.reason)
                .await?;
            return Ok(CancelJobResponse {
                cancelled: result.cancelled,
            });
        }

        let direct = self
            .direct_jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.job_id)
            .cloned();
        if let Some(route) = direct {
            let job_id = request.job_id.clone();
            let response = self
                .transport
                .call(
                    &route.agent_id,
                    &route.rpc_addr,
                    RpcRequest {
                        request: Some(rpc_request::Request::CancelJob(request)),
                    },
                )
                .await?;
            return match response.response {
                Some(rpc_response::Response::CancelJob(resp)) => {
                    if resp.cancelled {
                        self.direct_jobs
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&job_id);
                    }
                    Ok(resp)
                }
                Some(rpc_response::Response::Error(err)) => Err(CoreError::UpstreamError {
                    agent_id: route.agent_id,
                    code: err.code,
                    message: err.message,
                }),
                _ => Err(CoreError::Internal(format!(
                    "unexpected response variant from '{}'",
                    route.agent_id
                ))),
            };
        }

        Err(CoreError::UnknownJob(request.job_id))
    }

    /// A job's status: queried from its agent when live, served from the
    /// terminal cache when finished, `Unknown` otherwise.
    pub async fn get_job_result(
        &self,
        request: GetJobResultRequest,
    ) -> Result<GetJobResultResponse> {
        if let Some(agent_id) = self.tunnel.agent_for_job(&request.job_id) {
            let frame = self
                .tunnel
                .get_job_result(&agent_id, &request.job_id)
                .await?;
            return Ok(GetJobResultResponse {
                state: frame.state,
                payload: frame.payload,
                error: frame.error,
            });
        }

        let direct = self
            .direct_jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&request.job_id)
            .cloned();
        if let Some(route) = direct {
            let job_id = request.job_id.clone();
            let response = self
                .transport
                .call(
                    &route.agent_id,
                    &route.rpc_addr,
                    RpcRequest {
                        request: Some(rpc_request::Request::GetJobResult(request)),
                    },
                )
                .await?;
            return match response.response {
                Some(rpc_response::Response::GetJobResult(resp)) => {
                    if resp.job_state() != JobState::Running {
                        self.direct_jobs
                            .write()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&job_id);
                    }
                    Ok(resp)
                }
                Some(rpc_response::Response::Error(err)) => Err(CoreError::UpstreamError {
                    agent_id: route.agent_id,
                    code: err.code,
                    message: err.message,
                }),
                _ => Err(CoreError::Internal(format!(
                    "unexpected response variant from '{}'",
                    route.agent_id
                ))),
            };
        }

        match self.tunnel.cached_result(&request.job_id) {
            Some(cached) => Ok(GetJobResultResponse {
                state: cached.state as i32,
                payload: cached.payload,
                error: cached.error,
            }),
            None => Ok(GetJobResultResponse {
                state: JobState::Unknown as i32,
                payload: Vec::new(),
                error: String::new(),
            }),
        }
    }

    /// Union of service ids across every tunneled agent. Agents that fail or
    /// time out are skipped.
    pub async fn list_local(&self, request: ListLocalRequest) -> Result<ListLocalResponse> {
        let agents = self.tunnel.connected_agents("");
        let probes = agents
            .iter()
            .map(|agent_id| self.tunnel.list_local(agent_id, &request.function_id));
        let mut service_ids: Vec<String> = futures::future::join_all(probes)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(listed) => Some(listed.service_ids),
                Err(e) => {
                    warn!("list_local probe failed: {}", e);
                    None
                }
            })
            .flatten()
            .collect();
        service_ids.sort();
        service_ids.dedup();
        Ok(ListLocalResponse { service_ids })
    }
}

/// A one-shot stream replaying a cached terminal outcome.
fn replay_terminal(cached: TerminalResult) -> mpsc::Receiver<JobEvent> {
    let (tx, rx) = mpsc::channel(1);
    let event = JobEvent {
        r#type: match cached.state {
            JobState::Error | JobState::Cancelled => JobEventType::Error as i32,
            _ => JobEventType::Done as i32,
        },
        progress: 100,
        message: cached.error,
        payload: cached.payload,
    };
    // capacity 1, cannot fail
    let _ = tx.try_send(event);
    rx
}
