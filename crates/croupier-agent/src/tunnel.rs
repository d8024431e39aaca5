// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Reverse tunnel to the edge.
//!
//! The agent dials the edge's tunnel plane, opens one long-lived stream,
//! announces itself with a hello, and then serves edge-originated requests
//! over that stream. Liveness is signalled with a heartbeat every 15 s. When
//! the session drops for any reason the client redials with exponential
//! backoff, 1 s doubling up to 30 s, and resets after a session that was
//! admitted.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use croupier_proto::client::{CroupierClient, CroupierClientConfig};
use croupier_proto::frame::{Frame, read_frame, write_frame};
use croupier_proto::function::InvokeRequest;
use croupier_proto::tunnel::{
    CancelJobResult, JobResultFrame, ListLocalResult, ResultFrame, StartJobResult, TunnelMessage,
    tunnel_message,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatch::LocalDispatch;
use crate::error::{AgentError, Result};
use crate::executor::JobExecutor;
use crate::local::LocalRegistry;

/// Liveness signal cadence on an established tunnel.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(30);

/// Outbound frames queued toward the edge.
const OUTBOUND_BUFFER: usize = 64;

/// Dials the edge and serves tunnel requests until told to stop.
pub struct TunnelClient<D: LocalDispatch> {
    agent_id: String,
    game_id: String,
    env: String,
    /// Advertised in the hello so the edge can fall back to direct dialing.
    advertise_addr: String,
    tunnel_addr: SocketAddr,
    /// Empty means skip server verification (dev only).
    ca_pem: Vec<u8>,
    dispatch: Arc<D>,
    executor: Arc<JobExecutor<D>>,
    registry: Arc<LocalRegistry>,
    reconnects: AtomicU64,
}

impl<D: LocalDispatch> TunnelClient<D> {
    pub fn new(
        config: &crate::config::Config,
        tunnel_addr: SocketAddr,
        ca_pem: Vec<u8>,
        dispatch: Arc<D>,
        executor: Arc<JobExecutor<D>>,
        registry: Arc<LocalRegistry>,
    ) -> Self {
        Self {
            agent_id: config.agent_id.clone(),
            game_id: config.game_id.clone(),
            env: config.env.clone(),
            advertise_addr: config.advertise_addr.clone(),
            tunnel_addr,
            ca_pem,
            dispatch,
            executor,
            registry,
            reconnects: AtomicU64::new(0),
        }
    }

    /// Sessions attempted after the first.
    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    /// Dial-serve-redial loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = RECONNECT_BASE;
        loop {
            match self.clone().session().await {
                Ok(()) => {
                    info!(addr = %self.tunnel_addr, "tunnel session ended, redialing");
                    backoff = RECONNECT_BASE;
                }
                Err(err) => {
                    warn!(
                        addr = %self.tunnel_addr,
                        error = %err,
                        backoff_secs = backoff.as_secs(),
                        "tunnel session failed"
                    );
                }
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RECONNECT_CAP);
            self.reconnects.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// One tunnel session: dial, hello, serve until the stream ends.
    async fn session(self: Arc<Self>) -> Result<()> {
        let client = CroupierClient::new(CroupierClientConfig {
            server_addr: self.tunnel_addr,
            dangerous_skip_cert_verification: self.ca_pem.is_empty(),
            ca_pem: self.ca_pem.clone(),
            ..Default::default()
        })
        .map_err(|e| AgentError::dial(self.tunnel_addr.to_string(), e))?;
        let (mut send, mut recv) = client
            .open_raw_stream()
            .await
            .map_err(|e| AgentError::dial(self.tunnel_addr.to_string(), e))?;

        let hello = TunnelMessage::hello(
            &self.agent_id,
            &self.game_id,
            &self.env,
            &self.advertise_addr,
        );
        let frame = Frame::request(&hello).map_err(|e| AgentError::Tunnel(e.to_string()))?;
        write_frame(&mut send, &frame)
            .await
            .map_err(|e| AgentError::Tunnel(e.to_string()))?;
        info!(addr = %self.tunnel_addr, agent_id = %self.agent_id, "tunnel established");

        let (tx, mut outbound) = mpsc::channel::<TunnelMessage>(OUTBOUND_BUFFER);
        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let frame = match Frame::request(&msg) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!("failed to encode tunnel frame: {}", e);
                        continue;
                    }
                };
                if let Err(e) = write_frame(&mut send, &frame).await {
                    debug!("tunnel write failed: {}", e);
                    return;
                }
            }
        });
        let heartbeat_tx = tx.clone();
        let heartbeat_agent = self.agent_id.clone();
        let heartbeats = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_tx
                    .send(TunnelMessage::heartbeat(&heartbeat_agent))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let result = self.serve(&mut recv, &tx).await;
        heartbeats.abort();
        writer.abort();
        client.close().await;
        result
    }

    async fn serve(
        &self,
        recv: &mut quinn::RecvStream,
        tx: &mpsc::Sender<TunnelMessage>,
    ) -> Result<()> {
        loop {
            let frame = match read_frame(recv).await {
                Ok(frame) => frame,
                Err(e) => {
                    info!(agent_id = %self.agent_id, "tunnel stream ended: {}", e);
                    return Ok(());
                }
            };
            let message: TunnelMessage = frame
                .decode()
                .map_err(|e| AgentError::Tunnel(e.to_string()))?;
            match message.msg {
                Some(tunnel_message::Msg::Invoke(invoke)) => {
                    let dispatch = self.dispatch.clone();
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        let reply = match dispatch
                            .invoke(&invoke.function_id, &invoke.payload, &invoke.metadata)
                            .await
                        {
                            Ok(payload) => ResultFrame {
                                request_id: invoke.request_id,
                                payload,
                                error: String::new(),
                            },
                            Err(err) => ResultFrame {
                                request_id: invoke.request_id,
                                payload: Vec::new(),
                                error: err.to_string(),
                            },
                        };
                        let _ = tx.send(TunnelMessage::result(reply)).await;
                    });
                }
                Some(tunnel_message::Msg::StartJob(start)) => {
                    let request = InvokeRequest {
                        function_id: start.function_id,
                        payload: start.payload,
                        idempotency_key: start.idempotency_key,
                        metadata: start.metadata,
                    };
                    let (job_id, events) = self.executor.start_job(&request);
                    let reply = TunnelMessage {
                        msg: Some(tunnel_message::Msg::StartJobResult(StartJobResult {
                            request_id: start.request_id,
                            job_id: job_id.clone(),
                            error: String::new(),
                        })),
                    };
                    let tx = tx.clone();
                    tokio::spawn(async move {
                        // the job id must reach the edge before any event for it
                        if tx.send(reply).await.is_err() {
                            return;
                        }
                        let Some(mut events) = events else { return };
                        while let Some(event) = events.recv().await {
                            if tx
                                .send(TunnelMessage::job_event(job_id.clone(), event))
                                .await
                                .is_err()
                            {
                                return;
                            }
                        }
                    });
                }
                Some(tunnel_message::Msg::CancelJob(cancel)) => {
                    let cancelled = self.executor.cancel(&cancel.job_id, &cancel.reason);
                    let reply = TunnelMessage {
                        msg: Some(tunnel_message::Msg::CancelJobResult(CancelJobResult {
                            request_id: cancel.request_id,
                            job_id: cancel.job_id,
                            cancelled,
                        })),
                    };
                    if tx.send(reply).await.is_err() {
                        return Ok(());
                    }
                }
                Some(tunnel_message::Msg::ListLocal(query)) => {
                    let reply = TunnelMessage {
                        msg: Some(tunnel_message::Msg::ListLocalResult(ListLocalResult {
                            request_id: query.request_id,
                            service_ids: self.registry.list_local(&query.function_id),
                        })),
                    };
                    if tx.send(reply).await.is_err() {
                        return Ok(());
                    }
                }
                Some(tunnel_message::Msg::GetJobResult(query)) => {
                    let snapshot = self.executor.snapshot(&query.job_id);
                    let reply = TunnelMessage {
                        msg: Some(tunnel_message::Msg::JobResult(JobResultFrame {
                            request_id: query.request_id,
                            state: snapshot.state as i32,
                            payload: snapshot.payload,
                            error: snapshot.error,
                        })),
                    };
                    if tx.send(reply).await.is_err() {
                        return Ok(());
                    }
                }
                // an error result with no request id is the edge refusing the hello
                Some(tunnel_message::Msg::Result(result)) if result.request_id.is_empty() => {
                    return Err(AgentError::Tunnel(result.error));
                }
                Some(other) => {
                    debug!(agent_id = %self.agent_id, "ignoring unexpected tunnel frame: {:?}", other);
                }
                None => debug!(agent_id = %self.agent_id, "empty tunnel frame"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use async_trait::async_trait;
    use croupier_proto::function::{JobEventType, JobState};
    use croupier_proto::local::RegisterLocalRequest;
    use croupier_proto::server::CroupierServer;
    use croupier_proto::tunnel::{CancelJobFrame, InvokeFrame, JobResultQuery, ListLocalFrame, StartJobFrame};

    use crate::config::Config;

    struct EchoDispatch;

    #[async_trait]
    impl LocalDispatch for EchoDispatch {
        async fn invoke(
            &self,
            function_id: &str,
            payload: &[u8],
            _metadata: &HashMap<String, String>,
        ) -> Result<Vec<u8>> {
            if function_id == "table.broken" {
                return Err(AgentError::NoLocalEndpoint(function_id.to_string()));
            }
            Ok(payload.to_vec())
        }
    }

    fn test_config() -> Config {
        Config {
            agent_id: "agent-1".to_string(),
            game_id: "poker".to_string(),
            env: "prod".to_string(),
            region: String::new(),
            zone: String::new(),
            labels: HashMap::new(),
            rpc_addr: "127.0.0.1:0".parse().unwrap(),
            advertise_addr: "10.0.0.4:7301".to_string(),
            local_addr: "127.0.0.1:0".parse().unwrap(),
            control_addr: None,
            tunnel_addr: None,
            ca_path: None,
            tls_cert_path: None,
            tls_key_path: None,
        }
    }

    /// Fake edge: accepts one tunnel, forwards every received message to the
    /// test, and writes scripted messages after the hello arrives.
    async fn spawn_fake_edge(
        script: Vec<TunnelMessage>,
    ) -> (SocketAddr, mpsc::Receiver<TunnelMessage>) {
        let server = CroupierServer::localhost("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = server.local_addr().unwrap();
        let (seen_tx, seen_rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let _ = server
                .run(move |conn| {
                    let seen_tx = seen_tx.clone();
                    let script = script.clone();
                    async move {
                        conn.run(move |mut stream| {
                            let seen_tx = seen_tx.clone();
                            let script = script.clone();
                            async move {
                                // first frame must be the hello
                                let hello = stream.read_frame().await.unwrap();
                                let hello: TunnelMessage = hello.decode().unwrap();
                                seen_tx.send(hello).await.unwrap();
                                for msg in script {
                                    stream.write_frame(&Frame::request(&msg).unwrap()).await.unwrap();
                                }
                                while let Ok(frame) = stream.read_frame().await {
                                    let msg: TunnelMessage = frame.decode().unwrap();
                                    if seen_tx.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        })
                        .await;
                    }
                })
                .await;
        });
        (addr, seen_rx)
    }

    fn client_for(addr: SocketAddr) -> Arc<TunnelClient<EchoDispatch>> {
        let dispatch = Arc::new(EchoDispatch);
        let registry = Arc::new(LocalRegistry::new());
        registry.register(&RegisterLocalRequest {
            function_id: "table.close".to_string(),
            service_id: "svc-a".to_string(),
            addr: "127.0.0.1:9100".to_string(),
            version: "1.0.0".to_string(),
        });
        let executor = Arc::new(JobExecutor::new(dispatch.clone()));
        Arc::new(TunnelClient::new(
            &test_config(),
            addr,
            Vec::new(),
            dispatch,
            executor,
            registry,
        ))
    }

    async fn recv_msg(rx: &mut mpsc::Receiver<TunnelMessage>) -> tunnel_message::Msg {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for tunnel frame")
            .expect("fake edge closed")
            .msg
            .expect("empty tunnel frame")
    }

    #[tokio::test]
    async fn test_hello_advertises_identity_and_addr() {
        let (addr, mut seen) = spawn_fake_edge(Vec::new()).await;
        let client = client_for(addr);
        let session = tokio::spawn(client.session());

        match recv_msg(&mut seen).await {
            tunnel_message::Msg::Hello(hello) => {
                assert_eq!(hello.agent_id, "agent-1");
                assert_eq!(hello.game_id, "poker");
                assert_eq!(hello.env, "prod");
                assert_eq!(hello.rpc_addr, "10.0.0.4:7301");
            }
            other => panic!("expected hello, got {:?}", other),
        }
        session.abort();
    }

    #[tokio::test]
    async fn test_invoke_is_dispatched_and_answered() {
        let script = vec![
            TunnelMessage {
                msg: Some(tunnel_message::Msg::Invoke(InvokeFrame {
                    request_id: "r-1".to_string(),
                    function_id: "table.close".to_string(),
                    idempotency_key: String::new(),
                    payload: b"ping".to_vec(),
                    metadata: HashMap::new(),
                })),
            },
            TunnelMessage {
                msg: Some(tunnel_message::Msg::Invoke(InvokeFrame {
                    request_id: "r-2".to_string(),
                    function_id: "table.broken".to_string(),
                    idempotency_key: String::new(),
                    payload: Vec::new(),
                    metadata: HashMap::new(),
                })),
            },
        ];
        let (addr, mut seen) = spawn_fake_edge(script).await;
        let client = client_for(addr);
        let session = tokio::spawn(client.session());

        let _hello = recv_msg(&mut seen).await;
        let mut replies = HashMap::new();
        for _ in 0..2 {
            match recv_msg(&mut seen).await {
                tunnel_message::Msg::Result(result) => {
                    replies.insert(result.request_id.clone(), result);
                }
                other => panic!("expected result, got {:?}", other),
            }
        }
        assert_eq!(replies["r-1"].payload, b"ping");
        assert!(replies["r-1"].error.is_empty());
        assert!(replies["r-2"].error.contains("no local endpoint"));
        session.abort();
    }

    #[tokio::test]
    async fn test_start_job_streams_events_after_job_id() {
        let script = vec![TunnelMessage {
            msg: Some(tunnel_message::Msg::StartJob(StartJobFrame {
                request_id: "r-1".to_string(),
                function_id: "table.close".to_string(),
                idempotency_key: String::new(),
                payload: b"{}".to_vec(),
                metadata: HashMap::new(),
            })),
        }];
        let (addr, mut seen) = spawn_fake_edge(script).await;
        let client = client_for(addr);
        let session = tokio::spawn(client.session());

        let _hello = recv_msg(&mut seen).await;
        let job_id = match recv_msg(&mut seen).await {
            tunnel_message::Msg::StartJobResult(result) => {
                assert_eq!(result.request_id, "r-1");
                assert!(result.error.is_empty());
                result.job_id
            }
            other => panic!("expected start job result, got {:?}", other),
        };

        let mut last_progress = -1;
        loop {
            match recv_msg(&mut seen).await {
                tunnel_message::Msg::JobEvent(frame) => {
                    assert_eq!(frame.job_id, job_id);
                    let event = frame.event.unwrap();
                    assert!(event.progress >= last_progress);
                    last_progress = event.progress;
                    if event.is_terminal() {
                        assert_eq!(event.event_type(), JobEventType::Done);
                        assert_eq!(event.payload, b"{}");
                        break;
                    }
                }
                tunnel_message::Msg::Heartbeat(_) => continue,
                other => panic!("expected job event, got {:?}", other),
            }
        }
        session.abort();
    }

    #[tokio::test]
    async fn test_cancel_and_queries_are_answered() {
        let script = vec![
            TunnelMessage {
                msg: Some(tunnel_message::Msg::CancelJob(CancelJobFrame {
                    request_id: "r-1".to_string(),
                    job_id: "ghost".to_string(),
                    reason: "cleanup".to_string(),
                })),
            },
            TunnelMessage {
                msg: Some(tunnel_message::Msg::ListLocal(ListLocalFrame {
                    request_id: "r-2".to_string(),
                    function_id: "table.close".to_string(),
                })),
            },
            TunnelMessage {
                msg: Some(tunnel_message::Msg::GetJobResult(JobResultQuery {
                    request_id: "r-3".to_string(),
                    job_id: "ghost".to_string(),
                })),
            },
        ];
        let (addr, mut seen) = spawn_fake_edge(script).await;
        let client = client_for(addr);
        let session = tokio::spawn(client.session());

        let _hello = recv_msg(&mut seen).await;
        match recv_msg(&mut seen).await {
            tunnel_message::Msg::CancelJobResult(result) => {
                assert_eq!(result.request_id, "r-1");
                assert!(!result.cancelled);
            }
            other => panic!("expected cancel result, got {:?}", other),
        }
        match recv_msg(&mut seen).await {
            tunnel_message::Msg::ListLocalResult(result) => {
                assert_eq!(result.request_id, "r-2");
                assert_eq!(result.service_ids, vec!["svc-a"]);
            }
            other => panic!("expected list result, got {:?}", other),
        }
        match recv_msg(&mut seen).await {
            tunnel_message::Msg::JobResult(result) => {
                assert_eq!(result.request_id, "r-3");
                assert_eq!(result.state, JobState::Unknown as i32);
            }
            other => panic!("expected job result, got {:?}", other),
        }
        session.abort();
    }

    #[tokio::test]
    async fn test_rejected_hello_fails_the_session() {
        let script = vec![TunnelMessage::result(ResultFrame {
            request_id: String::new(),
            payload: Vec::new(),
            error: "agent 'agent-1' already connected".to_string(),
        })];
        let (addr, _seen) = spawn_fake_edge(script).await;
        let client = client_for(addr);

        let err = client.session().await.unwrap_err();
        match err {
            AgentError::Tunnel(reason) => assert!(reason.contains("already connected")),
            other => panic!("expected tunnel error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_edge_is_a_dial_failure() {
        let client = client_for("127.0.0.1:59996".parse().unwrap());
        let err = client.session().await.unwrap_err();
        assert!(matches!(err, AgentError::Dial { .. }));
    }
}
