// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Request routing to agent function planes.
//!
//! The router owns agent selection (balancer or targeted), the rate gate,
//! per-agent bookkeeping, and the job map that pins follow-up job operations
//! to the agent that started the job. Transport failures demote the agent's
//! health; application errors from the agent do not.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use croupier_proto::common::RpcError;
use croupier_proto::frame::{Frame, MessageType};
use croupier_proto::function::{
    CancelJobRequest, CancelJobResponse, GetJobResultRequest, GetJobResultResponse, InvokeRequest,
    InvokeResponse, JobEvent, JobEventType, JobState, JobStreamRequest, ListLocalRequest,
    ListLocalResponse, RpcRequest, RpcResponse, StartJobResponse, rpc_request, rpc_response,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::balancer::LoadBalancer;
use crate::error::{CoreError, Result};
use crate::limiter::RateLimiter;
use crate::pool::{ConnectionPool, QuicDialer};
use crate::registry::{AgentSession, Registry};
use crate::stats::{HealthChecker, StatsCollector};

/// Bound on each targeted-routing `ListLocal` probe.
const LIST_LOCAL_TIMEOUT: Duration = Duration::from_millis(300);

/// Buffered job events per subscriber.
const JOB_EVENT_BUFFER: usize = 16;

/// Transport to an agent's function plane.
///
/// `agent_id` is carried for error attribution only; `rpc_addr` is the dial
/// target.
#[async_trait]
pub trait AgentTransport: Send + Sync + 'static {
    async fn call(&self, agent_id: &str, rpc_addr: &str, request: RpcRequest)
    -> Result<RpcResponse>;

    /// Subscribe to a job's event stream. The returned channel closes after
    /// the terminal event.
    async fn stream_job(
        &self,
        agent_id: &str,
        rpc_addr: &str,
        job_id: &str,
    ) -> Result<mpsc::Receiver<JobEvent>>;
}

/// QUIC transport over the shared connection pool.
pub struct QuicTransport {
    pool: Arc<ConnectionPool<QuicDialer>>,
}

impl QuicTransport {
    pub fn new(pool: Arc<ConnectionPool<QuicDialer>>) -> Self {
        Self { pool }
    }
}

fn upstream_unavailable(agent_id: &str, err: impl std::fmt::Display) -> CoreError {
    CoreError::UpstreamUnavailable {
        agent_id: agent_id.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl AgentTransport for QuicTransport {
    async fn call(
        &self,
        agent_id: &str,
        rpc_addr: &str,
        request: RpcRequest,
    ) -> Result<RpcResponse> {
        let client = self.pool.get(rpc_addr).await?;
        client
            .request(&request)
            .await
            .map_err(|e| upstream_unavailable(agent_id, e))
    }

    async fn stream_job(
        &self,
        agent_id: &str,
        rpc_addr: &str,
        job_id: &str,
    ) -> Result<mpsc::Receiver<JobEvent>> {
        let client = self.pool.get(rpc_addr).await?;
        let mut stream = client
            .open_stream()
            .await
            .map_err(|e| upstream_unavailable(agent_id, e))?;

        let request = RpcRequest {
            request: Some(rpc_request::Request::StreamJob(JobStreamRequest {
                job_id: job_id.to_string(),
            })),
        };
        let frame =
            Frame::request(&request).map_err(|e| CoreError::Internal(format!("encode: {}", e)))?;
        stream
            .write_frame(&frame)
            .await
            .map_err(|e| upstream_unavailable(agent_id, e))?;

        // The first frame decides whether the subscription exists at all.
        let first = stream
            .read_frame()
            .await
            .map_err(|e| upstream_unavailable(agent_id, e))?;
        match first.message_type {
            MessageType::StreamStart => {}
            MessageType::Error => {
                let err: RpcError = first
                    .decode()
                    .map_err(|e| upstream_unavailable(agent_id, e))?;
                return Err(CoreError::UpstreamError {
                    agent_id: agent_id.to_string(),
                    code: err.code,
                    message: err.message,
                });
            }
            other => {
                return Err(CoreError::Internal(format!(
                    "unexpected frame type {:?} before job stream",
                    other
                )));
            }
        }

        let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            loop {
                let frame = match stream.read_frame().await {
                    Ok(frame) => frame,
                    Err(e) => {
                        // the stream died mid-job; surface it as an error event
                        let _ = tx
                            .send(JobEvent {
                                r#type: JobEventType::Error as i32,
                                progress: 0,
                                message: format!("job stream from '{}' broke: {}", agent_id, e),
                                payload: Vec::new(),
                            })
                            .await;
                        return;
                    }
                };
                match frame.message_type {
                    MessageType::StreamData => {
                        let event: JobEvent = match frame.decode() {
                            Ok(event) => event,
                            Err(e) => {
                                warn!(agent_id = %agent_id, %e, "undecodable job event");
                                continue;
                            }
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    MessageType::StreamEnd => return,
                    other => {
                        warn!(agent_id = %agent_id, ?other, "unexpected frame in job stream");
                        return;
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Where a job runs, pinned at `StartJob` time.
#[derive(Debug, Clone)]
struct JobRoute {
    agent_id: String,
    rpc_addr: String,
}

/// Routes function-plane requests to agents.
pub struct Router<T: AgentTransport> {
    transport: Arc<T>,
    registry: Arc<Registry>,
    balancer: Arc<dyn LoadBalancer>,
    stats: Arc<StatsCollector>,
    health: Arc<HealthChecker>,
    limiter: Arc<RateLimiter>,
    jobs: Arc<RwLock<HashMap<String, JobRoute>>>,
}

impl<T: AgentTransport> Router<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<Registry>,
        balancer: Arc<dyn LoadBalancer>,
        stats: Arc<StatsCollector>,
        health: Arc<HealthChecker>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            transport,
            registry,
            balancer,
            stats,
            health,
            limiter,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Route a unary invocation.
    pub async fn invoke(&self, request: InvokeRequest) -> Result<InvokeResponse> {
        let agent = self.select_agent(&request).await?;
        let wrapped = RpcRequest {
            request: Some(rpc_request::Request::Invoke(request)),
        };
        let response = self.call_agent(&agent, wrapped).await?;
        match response.response {
            Some(rpc_response::Response::Invoke(mut resp)) => {
                if resp.agent_id.is_empty() {
                    resp.agent_id = agent.agent_id.clone();
                }
                Ok(resp)
            }
            other => Err(unexpected_response(&agent.agent_id, &other)),
        }
    }

    /// Start a job and pin its follow-up operations to the chosen agent.
    pub async fn start_job(&self, request: InvokeRequest) -> Result<StartJobResponse> {
        let agent = self.select_agent(&request).await?;
        let wrapped = RpcRequest {
            request: Some(rpc_request::Request::StartJob(request)),
        };
        let response = self.call_agent(&agent, wrapped).await?;
        match response.response {
            Some(rpc_response::Response::StartJob(mut resp)) => {
                if resp.agent_id.is_empty() {
                    resp.agent_id = agent.agent_id.clone();
                }
                let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
                jobs.insert(
                    resp.job_id.clone(),
                    JobRoute {
                        agent_id: agent.agent_id.clone(),
                        rpc_addr: agent.rpc_addr.clone(),
                    },
                );
                debug!(job_id = %resp.job_id, agent_id = %agent.agent_id, "job started");
                Ok(resp)
            }
            other => Err(unexpected_response(&agent.agent_id, &other)),
        }
    }

    /// Subscribe to a job's events. The job map entry is dropped once the
    /// terminal event has been delivered.
    pub async fn stream_job(&self, job_id: &str) -> Result<mpsc::Receiver<JobEvent>> {
        let route = self
            .job_route(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;

        let upstream = self
            .transport
            .stream_job(&route.agent_id, &route.rpc_addr, job_id)
            .await;
        let mut upstream = match upstream {
            Ok(rx) => rx,
            Err(err) => {
                if err.is_transport_failure() {
                    self.health.set_healthy(&route.agent_id, false);
                }
                return Err(err);
            }
        };

        let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
        let jobs = self.jobs.clone();
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = upstream.recv().await {
                let terminal = event.is_terminal();
                if tx.send(event).await.is_err() {
                    return;
                }
                if terminal {
                    let mut jobs = jobs.write().unwrap_or_else(|e| e.into_inner());
                    jobs.remove(&job_id);
                    return;
                }
            }
        });
        Ok(rx)
    }

    /// Cancel a running job on its owning agent.
    pub async fn cancel_job(&self, job_id: &str, reason: &str) -> Result<CancelJobResponse> {
        let route = self
            .job_route(job_id)
            .ok_or_else(|| CoreError::UnknownJob(job_id.to_string()))?;
        let agent = self.session_for_route(&route);
        let wrapped = RpcRequest {
            request: Some(rpc_request::Request::CancelJob(CancelJobRequest {
                job_id: job_id.to_string(),
                reason: reason.to_string(),
            })),
        };
        let response = self.call_agent(&agent, wrapped).await?;
        match response.response {
            Some(rpc_response::Response::CancelJob(resp)) => {
                if resp.cancelled {
                    let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
                    jobs.remove(job_id);
                }
                Ok(resp)
            }
            other => Err(unexpected_response(&agent.agent_id, &other)),
        }
    }

    /// Fetch a job's state. Unmapped ids report `Unknown` rather than
    /// erroring, so callers can poll after the stream is gone.
    pub async fn get_job_result(&self, job_id: &str) -> Result<GetJobResultResponse> {
        let Some(route) = self.job_route(job_id) else {
            return Ok(GetJobResultResponse {
                state: JobState::Unknown as i32,
                payload: Vec::new(),
                error: String::new(),
            });
        };
        let agent = self.session_for_route(&route);
        let wrapped = RpcRequest {
            request: Some(rpc_request::Request::GetJobResult(GetJobResultRequest {
                job_id: job_id.to_string(),
            })),
        };
        let response = self.call_agent(&agent, wrapped).await?;
        match response.response {
            Some(rpc_response::Response::GetJobResult(resp)) => {
                if resp.job_state() != JobState::Running {
                    let mut jobs = self.jobs.write().unwrap_or_else(|e| e.into_inner());
                    jobs.remove(job_id);
                }
                Ok(resp)
            }
            other => Err(unexpected_response(&agent.agent_id, &other)),
        }
    }

    /// Pick the agent for an invocation: targeted routing when requested,
    /// the configured balancer otherwise. The rate gate runs on the chosen
    /// agent before any dialing happens.
    async fn select_agent(&self, request: &InvokeRequest) -> Result<AgentSession> {
        let game_id = metadata(&request.metadata, "game_id");
        let candidates =
            self.registry
                .agents_for_function_scoped(game_id, &request.function_id, true);
        if candidates.is_empty() {
            return Err(CoreError::NoAgentAvailable(request.function_id.clone()));
        }

        let target_service = metadata(&request.metadata, "target_service_id");
        let agent = if metadata(&request.metadata, "route") == "targeted" && !target_service.is_empty()
        {
            self.find_target(&candidates, &request.function_id, target_service)
                .await?
        } else {
            let key = metadata(&request.metadata, "hash_key");
            self.balancer.pick(&candidates, key)?
        };

        self.limiter.check(&agent, &request.function_id)?;
        Ok(agent)
    }

    /// Probe candidates for the one hosting `service_id`. First match wins;
    /// unreachable agents are skipped.
    async fn find_target(
        &self,
        candidates: &[AgentSession],
        function_id: &str,
        service_id: &str,
    ) -> Result<AgentSession> {
        for agent in candidates {
            if !self.health.is_healthy(&agent.agent_id) {
                continue;
            }
            let wrapped = RpcRequest {
                request: Some(rpc_request::Request::ListLocal(ListLocalRequest {
                    function_id: function_id.to_string(),
                })),
            };
            let probe = tokio::time::timeout(
                LIST_LOCAL_TIMEOUT,
                self.transport.call(&agent.agent_id, &agent.rpc_addr, wrapped),
            )
            .await;
            let response = match probe {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    debug!(agent_id = %agent.agent_id, %e, "targeted probe failed");
                    continue;
                }
                Err(_) => {
                    debug!(agent_id = %agent.agent_id, "targeted probe timed out");
                    continue;
                }
            };
            if let Some(rpc_response::Response::ListLocal(ListLocalResponse { service_ids })) =
                response.response
                && service_ids.iter().any(|s| s == service_id)
            {
                return Ok(agent.clone());
            }
        }
        Err(CoreError::TargetNotFound(service_id.to_string()))
    }

    /// One bookkept agent call. An `Error` response becomes `UpstreamError`
    /// and counts as a failed request without demoting health; transport
    /// failures do both.
    async fn call_agent(&self, agent: &AgentSession, request: RpcRequest) -> Result<RpcResponse> {
        self.stats.increment_active(&agent.agent_id);
        let started = Instant::now();
        let result = self
            .transport
            .call(&agent.agent_id, &agent.rpc_addr, request)
            .await;
        let elapsed = started.elapsed();
        self.stats.decrement_active(&agent.agent_id);

        let response = match result {
            Ok(response) => response,
            Err(err) => {
                self.stats.record_request(&agent.agent_id, elapsed, false);
                if err.is_transport_failure() {
                    self.health.set_healthy(&agent.agent_id, false);
                }
                return Err(err);
            }
        };
        if let Some(rpc_response::Response::Error(err)) = response.response {
            self.stats.record_request(&agent.agent_id, elapsed, false);
            return Err(CoreError::UpstreamError {
                agent_id: agent.agent_id.clone(),
                code: err.code,
                message: err.message,
            });
        }
        self.stats.record_request(&agent.agent_id, elapsed, true);
        Ok(response)
    }

    fn job_route(&self, job_id: &str) -> Option<JobRoute> {
        let jobs = self.jobs.read().unwrap_or_else(|e| e.into_inner());
        jobs.get(job_id).cloned()
    }

    /// Session for a pinned job route. The registry copy is preferred so
    /// bookkeeping follows current metadata; an expired agent still gets the
    /// call since the job may be finishing on it.
    fn session_for_route(&self, route: &JobRoute) -> AgentSession {
        if let Some(session) = self.registry.get(&route.agent_id) {
            return session;
        }
        AgentSession {
            agent_id: route.agent_id.clone(),
            version: String::new(),
            rpc_addr: route.rpc_addr.clone(),
            game_id: String::new(),
            env: String::new(),
            region: String::new(),
            zone: String::new(),
            labels: HashMap::new(),
            functions: HashMap::new(),
            session_id: String::new(),
            expire_at: chrono::Utc::now(),
        }
    }
}

fn metadata<'a>(metadata: &'a HashMap<String, String>, key: &str) -> &'a str {
    metadata.get(key).map(String::as_str).unwrap_or("")
}

fn unexpected_response(agent_id: &str, response: &Option<rpc_response::Response>) -> CoreError {
    CoreError::Internal(format!(
        "agent '{}' answered with mismatched response variant: {:?}",
        agent_id,
        response.as_ref().map(std::mem::discriminant)
    ))
}

/// In-memory transport for routing and handler tests.
#[cfg(test)]
pub(crate) mod testutil {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    pub(crate) struct MockTransport {
        pub(crate) calls: AtomicUsize,
        unreachable: Mutex<HashSet<String>>,
        rpc_errors: Mutex<HashMap<String, RpcError>>,
        local_services: Mutex<HashMap<String, Vec<String>>>,
        job_events: Mutex<Vec<JobEvent>>,
    }

    impl MockTransport {
        pub(crate) fn mark_unreachable(&self, agent_id: &str) {
            self.unreachable
                .lock()
                .unwrap()
                .insert(agent_id.to_string());
        }

        pub(crate) fn set_rpc_error(&self, agent_id: &str, code: &str, message: &str) {
            self.rpc_errors
                .lock()
                .unwrap()
                .insert(agent_id.to_string(), RpcError::new(code, message));
        }

        pub(crate) fn set_local_services(&self, agent_id: &str, services: &[&str]) {
            self.local_services.lock().unwrap().insert(
                agent_id.to_string(),
                services.iter().map(|s| s.to_string()).collect(),
            );
        }

        pub(crate) fn set_job_events(&self, events: Vec<JobEvent>) {
            *self.job_events.lock().unwrap() = events;
        }
    }

    #[async_trait]
    impl AgentTransport for MockTransport {
        async fn call(
            &self,
            agent_id: &str,
            _rpc_addr: &str,
            request: RpcRequest,
        ) -> Result<RpcResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.unreachable.lock().unwrap().contains(agent_id) {
                return Err(CoreError::UpstreamUnavailable {
                    agent_id: agent_id.to_string(),
                    reason: "connection reset".to_string(),
                });
            }
            if let Some(err) = self.rpc_errors.lock().unwrap().get(agent_id) {
                return Ok(RpcResponse {
                    response: Some(rpc_response::Response::Error(err.clone())),
                });
            }
            let response = match request.request {
                Some(rpc_request::Request::Invoke(_)) => {
                    rpc_response::Response::Invoke(InvokeResponse {
                        payload: br#"{"ok":true}"#.to_vec(),
                        agent_id: agent_id.to_string(),
                    })
                }
                Some(rpc_request::Request::StartJob(_)) => {
                    rpc_response::Response::StartJob(StartJobResponse {
                        job_id: "job-1".to_string(),
                        agent_id: agent_id.to_string(),
                    })
                }
                Some(rpc_request::Request::CancelJob(_)) => {
                    rpc_response::Response::CancelJob(CancelJobResponse { cancelled: true })
                }
                Some(rpc_request::Request::GetJobResult(_)) => {
                    rpc_response::Response::GetJobResult(GetJobResultResponse {
                        state: JobState::Done as i32,
                        payload: b"{}".to_vec(),
                        error: String::new(),
                    })
                }
                Some(rpc_request::Request::ListLocal(_)) => {
                    rpc_response::Response::ListLocal(ListLocalResponse {
                        service_ids: self
                            .local_services
                            .lock()
                            .unwrap()
                            .get(agent_id)
                            .cloned()
                            .unwrap_or_default(),
                    })
                }
                other => panic!("unexpected request: {:?}", other),
            };
            Ok(RpcResponse {
                response: Some(response),
            })
        }

        async fn stream_job(
            &self,
            _agent_id: &str,
            _rpc_addr: &str,
            _job_id: &str,
        ) -> Result<mpsc::Receiver<JobEvent>> {
            let events = self.job_events.lock().unwrap().clone();
            let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
            tokio::spawn(async move {
                for event in events {
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            });
            Ok(rx)
        }
    }
}
