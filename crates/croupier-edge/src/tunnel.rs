// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunnel server: terminates the long-lived reverse streams agents dial in
//! on, correlates edge→agent requests with agent→edge replies, and fans job
//! events out to subscribers.
//!
//! Each tunnel starts with a `Hello` frame; after admission the connection
//! splits into a writer task draining the agent's outbound queue and a reader
//! loop dispatching inbound frames. Every request carries a fresh uuid
//! `request_id`; the reply echoes it and unblocks the waiting caller through
//! a one-shot channel. Entries are removed on reply, timeout, and tunnel
//! loss alike, so the correlation table never leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use croupier_proto::frame::Frame;
use croupier_proto::function::{InvokeRequest, JobEvent, JobEventType, JobState};
use croupier_proto::server::StreamHandler;
use croupier_proto::tunnel::{
    CancelJobFrame, CancelJobResult, Hello, InvokeFrame, JobResultFrame, JobResultQuery,
    ListLocalFrame, ListLocalResult, ResultFrame, StartJobFrame, StartJobResult, TunnelMessage,
    tunnel_message,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Result, TunnelError};

/// Correlation deadline for control frames (invoke, start, cancel).
pub const CONTROL_DEADLINE: Duration = Duration::from_secs(5);

/// Correlation deadline for the lighter queries (list_local, get_job_result).
pub const QUERY_DEADLINE: Duration = Duration::from_secs(3);

/// Buffered job events per subscriber. Delivery is non-blocking; a slow
/// subscriber loses intermediate events, never the terminal one.
const JOB_EVENT_BUFFER: usize = 16;

/// Outbound frame queue per agent tunnel.
const OUTBOUND_BUFFER: usize = 64;

/// How long a terminal job result stays servable after the job finished.
const TERMINAL_TTL: Duration = Duration::from_secs(600);

/// Tunnel traffic counters. Gauges come from the live tables.
#[derive(Debug, Default)]
pub struct TunnelMetrics {
    connects: AtomicU64,
    disconnects: AtomicU64,
    invokes: AtomicU64,
    starts: AtomicU64,
    events: AtomicU64,
    cancels: AtomicU64,
}

/// Point-in-time view of the tunnel metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connects: u64,
    pub disconnects: u64,
    pub invokes: u64,
    pub starts: u64,
    pub events: u64,
    pub cancels: u64,
    pub agents: usize,
    pub pending: usize,
    pub jobs: usize,
}

/// One admitted agent tunnel.
struct AgentHandle {
    tx: mpsc::Sender<TunnelMessage>,
    /// Distinguishes this tunnel from a successor with the same agent id.
    epoch: u64,
    game_id: String,
    env: String,
    rpc_addr: String,
    last_seen: Instant,
}

/// Handed to the connection glue (or a test) after a successful `Hello`.
#[derive(Debug)]
pub struct AgentRegistration {
    pub agent_id: String,
    pub epoch: u64,
    /// Frames queued for this agent; the writer task drains them onto the
    /// stream.
    pub outbound: mpsc::Receiver<TunnelMessage>,
}

/// Cached outcome of a finished job.
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub state: JobState,
    pub payload: Vec<u8>,
    pub error: String,
    stored_at: Instant,
}

enum TunnelReply {
    Invoke(ResultFrame),
    StartJob(StartJobResult),
    Cancel(CancelJobResult),
    ListLocal(ListLocalResult),
    JobResult(JobResultFrame),
}

pub struct TunnelServer {
    agents: RwLock<HashMap<String, AgentHandle>>,
    /// Last advertised rpc_addr per agent, kept past disconnect for the
    /// direct-dial fallback.
    known_addrs: RwLock<HashMap<String, String>>,
    pending: Mutex<HashMap<String, oneshot::Sender<TunnelReply>>>,
    jobs: RwLock<HashMap<String, String>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::Sender<JobEvent>>>>,
    terminal: Mutex<HashMap<String, TerminalResult>>,
    epochs: AtomicU64,
    metrics: TunnelMetrics,
}

impl Default for TunnelServer {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelServer {
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            known_addrs: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            jobs: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            terminal: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
            metrics: TunnelMetrics::default(),
        }
    }

    /// Admit an agent after its `Hello`. A live tunnel under the same agent
    /// id rejects the newcomer; a dead one is replaced.
    pub fn admit(&self, hello: &Hello) -> Result<AgentRegistration> {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = agents.get(&hello.agent_id)
            && !existing.tx.is_closed()
        {
            return Err(TunnelError::DuplicateAgent(hello.agent_id.clone()));
        }

        let (tx, outbound) = mpsc::channel(OUTBOUND_BUFFER);
        let epoch = self.epochs.fetch_add(1, Ordering::Relaxed) + 1;
        agents.insert(
            hello.agent_id.clone(),
            AgentHandle {
                tx,
                epoch,
                game_id: hello.game_id.clone(),
                env: hello.env.clone(),
                rpc_addr: hello.rpc_addr.clone(),
                last_seen: Instant::now(),
            },
        );
        drop(agents);

        if !hello.rpc_addr.is_empty() {
            self.known_addrs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(hello.agent_id.clone(), hello.rpc_addr.clone());
        }
        self.metrics.connects.fetch_add(1, Ordering::Relaxed);
        info!(
            agent_id = %hello.agent_id,
            game_id = %hello.game_id,
            env = %hello.env,
            "agent tunnel connected"
        );
        Ok(AgentRegistration {
            agent_id: hello.agent_id.clone(),
            epoch,
            outbound,
        })
    }

    /// Drop an agent tunnel. The epoch guards against a reconnected tunnel
    /// being removed by its predecessor's cleanup.
    pub fn remove(&self, agent_id: &str, epoch: u64) {
        let removed = {
            let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
            match agents.get(agent_id) {
                Some(handle) if handle.epoch == epoch => {
                    agents.remove(agent_id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.metrics.disconnects.fetch_add(1, Ordering::Relaxed);
            info!(agent_id = %agent_id, "agent tunnel disconnected");
        }
    }

    /// Route one inbound frame from an agent.
    pub fn dispatch(&self, agent_id: &str, msg: TunnelMessage) {
        use tunnel_message::Msg;
        match msg.msg {
            Some(Msg::Heartbeat(_)) => self.touch(agent_id),
            Some(Msg::Result(f)) => {
                let request_id = f.request_id.clone();
                self.complete(&request_id, TunnelReply::Invoke(f));
            }
            Some(Msg::StartJobResult(f)) => {
                let request_id = f.request_id.clone();
                self.complete(&request_id, TunnelReply::StartJob(f));
            }
            Some(Msg::CancelJobResult(f)) => {
                let request_id = f.request_id.clone();
                self.complete(&request_id, TunnelReply::Cancel(f));
            }
            Some(Msg::ListLocalResult(f)) => {
                let request_id = f.request_id.clone();
                self.complete(&request_id, TunnelReply::ListLocal(f));
            }
            Some(Msg::JobResult(f)) => {
                let request_id = f.request_id.clone();
                self.complete(&request_id, TunnelReply::JobResult(f));
            }
            Some(Msg::JobEvent(f)) => {
                if let Some(event) = f.event {
                    self.publish(&f.job_id, event);
                }
            }
            Some(Msg::Hello(_)) => {
                debug!(agent_id = %agent_id, "duplicate hello on established tunnel ignored")
            }
            Some(_) => {
                warn!(agent_id = %agent_id, "request-bearing frame from agent ignored")
            }
            None => debug!(agent_id = %agent_id, "empty tunnel frame ignored"),
        }
    }

    fn touch(&self, agent_id: &str) {
        let mut agents = self.agents.write().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = agents.get_mut(agent_id) {
            handle.last_seen = Instant::now();
        }
    }

    fn complete(&self, request_id: &str, reply: TunnelReply) {
        let entry = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
        match entry {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(request_id = %request_id, "late tunnel reply dropped"),
        }
    }

    /// Fan a job event out to subscribers. A terminal event also caches the
    /// result, unmaps the job, and closes every subscriber channel.
    fn publish(&self, job_id: &str, event: JobEvent) {
        self.metrics.events.fetch_add(1, Ordering::Relaxed);
        if event.is_terminal() {
            let state = match event.event_type() {
                JobEventType::Error => JobState::Error,
                _ => JobState::Done,
            };
            // Cache before unmapping so a caller that misses the job map
            // always finds the cache.
            self.store_terminal(job_id, state, event.payload.clone(), event.message.clone());
            self.jobs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(job_id);
            let subs = self
                .subscribers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(job_id);
            for tx in subs.into_iter().flatten() {
                match tx.try_send(event.clone()) {
                    Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
                    // a full buffer drops intermediates, never the terminal
                    // event; park a sender until the subscriber drains
                    Err(mpsc::error::TrySendError::Full(event)) => {
                        tokio::spawn(async move {
                            let _ = tx.send(event).await;
                        });
                    }
                }
            }
        } else {
            let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(list) = subs.get_mut(job_id) {
                list.retain(|tx| match tx.try_send(event.clone()) {
                    Ok(()) => true,
                    // full: this subscriber misses the event but stays
                    Err(mpsc::error::TrySendError::Full(_)) => true,
                    Err(mpsc::error::TrySendError::Closed(_)) => false,
                });
            }
        }
    }

    /// Subscribe to a live job's events. `None` when the job is not mapped;
    /// callers then consult `cached_result`.
    pub fn subscribe(&self, job_id: &str) -> Option<mpsc::Receiver<JobEvent>> {
        // Holding the subscribers lock across the job check closes the race
        // with a concurrent terminal event, which unmaps the job before it
        // takes this lock.
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        if !self
            .jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(job_id)
        {
            return None;
        }
        let (tx, rx) = mpsc::channel(JOB_EVENT_BUFFER);
        subs.entry(job_id.to_string()).or_default().push(tx);
        Some(rx)
    }

    fn store_terminal(&self, job_id: &str, state: JobState, payload: Vec<u8>, error: String) {
        let mut terminal = self.terminal.lock().unwrap_or_else(|e| e.into_inner());
        terminal.retain(|_, entry| entry.stored_at.elapsed() < TERMINAL_TTL);
        terminal.insert(
            job_id.to_string(),
            TerminalResult {
                state,
                payload,
                error,
                stored_at: Instant::now(),
            },
        );
    }

    /// A finished job's cached outcome, if it is still within the TTL.
    pub fn cached_result(&self, job_id: &str) -> Option<TerminalResult> {
        let mut terminal = self.terminal.lock().unwrap_or_else(|e| e.into_inner());
        terminal.retain(|_, entry| entry.stored_at.elapsed() < TERMINAL_TTL);
        terminal.get(job_id).cloned()
    }

    async fn request(
        &self,
        agent_id: &str,
        request_id: &str,
        msg: TunnelMessage,
        deadline: Duration,
    ) -> Result<TunnelReply> {
        let agent_tx = self
            .agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .map(|h| h.tx.clone())
            .ok_or_else(|| TunnelError::AgentNotConnected(agent_id.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(request_id.to_string(), tx);

        if agent_tx.send(msg).await.is_err() {
            self.drop_pending(request_id);
            return Err(TunnelError::AgentNotConnected(agent_id.to_string()));
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.drop_pending(request_id);
                Err(TunnelError::ClosedWhilePending {
                    agent_id: agent_id.to_string(),
                    request_id: request_id.to_string(),
                })
            }
            Err(_) => {
                self.drop_pending(request_id);
                Err(TunnelError::Timeout {
                    agent_id: agent_id.to_string(),
                    request_id: request_id.to_string(),
                })
            }
        }
    }

    fn drop_pending(&self, request_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(request_id);
    }

    /// Synchronous invocation over the tunnel.
    pub async fn invoke(&self, agent_id: &str, request: &InvokeRequest) -> Result<ResultFrame> {
        self.metrics.invokes.fetch_add(1, Ordering::Relaxed);
        let request_id = Uuid::new_v4().to_string();
        let msg = TunnelMessage {
            msg: Some(tunnel_message::Msg::Invoke(InvokeFrame {
                request_id: request_id.clone(),
                function_id: request.function_id.clone(),
                idempotency_key: request.idempotency_key.clone(),
                payload: request.payload.clone(),
                metadata: request.metadata.clone(),
            })),
        };
        match self
            .request(agent_id, &request_id, msg, CONTROL_DEADLINE)
            .await?
        {
            TunnelReply::Invoke(frame) => Ok(frame),
            _ => Err(TunnelError::UnexpectedReply {
                agent_id: agent_id.to_string(),
                request_id,
            }),
        }
    }

    /// Start a job over the tunnel. A successful result pins the job to this
    /// agent for subsequent stream/cancel/result calls.
    pub async fn start_job(&self, agent_id: &str, request: &InvokeRequest) -> Result<StartJobResult> {
        self.metrics.starts.fetch_add(1, Ordering::Relaxed);
        let request_id = Uuid::new_v4().to_string();
        let msg = TunnelMessage {
            msg: Some(tunnel_message::Msg::StartJob(StartJobFrame {
                request_id: request_id.clone(),
                function_id: request.function_id.clone(),
                idempotency_key: request.idempotency_key.clone(),
                payload: request.payload.clone(),
                metadata: request.metadata.clone(),
            })),
        };
        let result = match self
            .request(agent_id, &request_id, msg, CONTROL_DEADLINE)
            .await?
        {
            TunnelReply::StartJob(result) => result,
            _ => {
                return Err(TunnelError::UnexpectedReply {
                    agent_id: agent_id.to_string(),
                    request_id,
                });
            }
        };
        if result.error.is_empty() && !result.job_id.is_empty() {
            self.jobs
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(result.job_id.clone(), agent_id.to_string());
        }
        Ok(result)
    }

    /// Best-effort cancellation over the tunnel.
    pub async fn cancel_job(
        &self,
        agent_id: &str,
        job_id: &str,
        reason: &str,
    ) -> Result<CancelJobResult> {
        self.metrics.cancels.fetch_add(1, Ordering::Relaxed);
        let request_id = Uuid::new_v4().to_string();
        let msg = TunnelMessage {
            msg: Some(tunnel_message::Msg::CancelJob(CancelJobFrame {
                request_id: request_id.clone(),
                job_id: job_id.to_string(),
                reason: reason.to_string(),
            })),
        };
        match self
            .request(agent_id, &request_id, msg, CONTROL_DEADLINE)
            .await?
        {
            TunnelReply::Cancel(result) => Ok(result),
            _ => Err(TunnelError::UnexpectedReply {
                agent_id: agent_id.to_string(),
                request_id,
            }),
        }
    }

    /// Ask an agent which local service ids expose a function.
    pub async fn list_local(&self, agent_id: &str, function_id: &str) -> Result<ListLocalResult> {
        let request_id = Uuid::new_v4().to_string();
        let msg = TunnelMessage {
            msg: Some(tunnel_message::Msg::ListLocal(ListLocalFrame {
                request_id: request_id.clone(),
                function_id: function_id.to_string(),
            })),
        };
        match self
            .request(agent_id, &request_id, msg, QUERY_DEADLINE)
            .await?
        {
            TunnelReply::ListLocal(result) => Ok(result),
            _ => Err(TunnelError::UnexpectedReply {
                agent_id: agent_id.to_string(),
                request_id,
            }),
        }
    }

    /// Query an agent for a job's current status snapshot.
    pub async fn get_job_result(&self, agent_id: &str, job_id: &str) -> Result<JobResultFrame> {
        let request_id = Uuid::new_v4().to_string();
        let msg = TunnelMessage {
            msg: Some(tunnel_message::Msg::GetJobResult(JobResultQuery {
                request_id: request_id.clone(),
                job_id: job_id.to_string(),
            })),
        };
        match self
            .request(agent_id, &request_id, msg, QUERY_DEADLINE)
            .await?
        {
            TunnelReply::JobResult(frame) => Ok(frame),
            _ => Err(TunnelError::UnexpectedReply {
                agent_id: agent_id.to_string(),
                request_id,
            }),
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .is_some_and(|h| !h.tx.is_closed())
    }

    /// The agent a live job is pinned to.
    pub fn agent_for_job(&self, job_id: &str) -> Option<String> {
        self.jobs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    /// Last advertised rpc_addr for an agent, live or not.
    pub fn known_addr(&self, agent_id: &str) -> Option<String> {
        self.known_addrs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .cloned()
    }

    /// Connected agent ids, filtered by game when `game_id` is non-empty.
    /// Sorted for stable rotation.
    pub fn connected_agents(&self, game_id: &str) -> Vec<String> {
        let agents = self.agents.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = agents
            .iter()
            .filter(|(_, h)| !h.tx.is_closed())
            .filter(|(_, h)| game_id.is_empty() || h.game_id == game_id)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Seconds since the agent's last frame, for liveness views.
    pub fn idle_for(&self, agent_id: &str) -> Option<Duration> {
        self.agents
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(agent_id)
            .map(|h| h.last_seen.elapsed())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connects: self.metrics.connects.load(Ordering::Relaxed),
            disconnects: self.metrics.disconnects.load(Ordering::Relaxed),
            invokes: self.metrics.invokes.load(Ordering::Relaxed),
            starts: self.metrics.starts.load(Ordering::Relaxed),
            events: self.metrics.events.load(Ordering::Relaxed),
            cancels: self.metrics.cancels.load(Ordering::Relaxed),
            agents: self
                .agents
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            pending: self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
            jobs: self.jobs.read().unwrap_or_else(|e| e.into_inner()).len(),
        }
    }

    /// Drive one accepted QUIC stream as a tunnel until it drops.
    pub async fn serve(self: Arc<Self>, mut stream: StreamHandler) {
        let frame = match stream.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!("tunnel opener dropped before hello: {}", e);
                return;
            }
        };
        let msg: TunnelMessage = match frame.decode() {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable tunnel opener: {}", e);
                return;
            }
        };
        let hello = match msg.msg {
            Some(tunnel_message::Msg::Hello(hello)) if !hello.agent_id.is_empty() => hello,
            _ => {
                let _ = reject(&mut stream, "first tunnel frame must be a hello with an agent id")
                    .await;
                return;
            }
        };

        let registration = match self.admit(&hello) {
            Ok(registration) => registration,
            Err(e) => {
                warn!(agent_id = %hello.agent_id, "tunnel rejected: {}", e);
                let _ = reject(&mut stream, &e.to_string()).await;
                return;
            }
        };
        let AgentRegistration {
            agent_id,
            epoch,
            mut outbound,
        } = registration;

        let (mut send, mut recv) = stream.into_parts();
        let writer_agent = agent_id.clone();
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let frame = match Frame::request(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(agent_id = %writer_agent, "tunnel frame encode failed: {}", e);
                        continue;
                    }
                };
                if let Err(e) = croupier_proto::frame::write_frame(&mut send, &frame).await {
                    debug!(agent_id = %writer_agent, "tunnel write failed: {}", e);
                    return;
                }
            }
        });

        loop {
            let frame = match croupier_proto::frame::read_frame(&mut recv).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(agent_id = %agent_id, "tunnel read ended: {}", e);
                    break;
                }
            };
            match frame.decode::<TunnelMessage>() {
                Ok(msg) => self.dispatch(&agent_id, msg),
                Err(e) => warn!(agent_id = %agent_id, "undecodable tunnel frame: {}", e),
            }
        }

        writer.abort();
        self.remove(&agent_id, epoch);
    }
}

/// Answer a bad opener with an explicit error before closing the stream.
async fn reject(stream: &mut StreamHandler, reason: &str) -> anyhow::Result<()> {
    let msg = TunnelMessage::result(ResultFrame {
        request_id: String::new(),
        payload: Vec::new(),
        error: reason.to_string(),
    });
    stream.write_frame(&Frame::request(&msg)?).await?;
    stream.finish()?;
    Ok(())
}
