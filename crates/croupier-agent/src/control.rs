// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane client: registration, heartbeats, assignment polling.
//!
//! Every 30 s the agent fetches its function assignments, then either
//! refreshes its registration (first contact, or when the exposed function
//! set changed) or heartbeats the existing session. A rejected heartbeat
//! means the core lost the session, so the agent re-registers on the spot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use croupier_proto::client::{CroupierClient, CroupierClientConfig, RetryPolicy};
use croupier_proto::control::{
    self, FunctionSpec, GetAssignmentsRequest, HeartbeatRequest, RegisterRequest, rpc_request,
    rpc_response,
};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{AgentError, Result};
use crate::local::LocalRegistry;

/// Assignment and registration refresh cadence.
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Keeps the agent registered with the core control plane.
pub struct ControlClient {
    agent_id: String,
    game_id: String,
    env: String,
    region: String,
    zone: String,
    labels: HashMap<String, String>,
    /// Dialable function-plane address advertised at registration.
    advertise_addr: String,
    control_addr: SocketAddr,
    client: CroupierClient,
    retry: RetryPolicy,
    registry: Arc<LocalRegistry>,
    /// Assigned function ids for this game/env; empty means no restriction.
    assignments: RwLock<Vec<String>>,
    session_id: Mutex<Option<String>>,
    /// Function ids sent with the last successful registration.
    exposed: Mutex<Vec<String>>,
}

impl ControlClient {
    pub fn new(
        config: &Config,
        control_addr: SocketAddr,
        ca_pem: Vec<u8>,
        registry: Arc<LocalRegistry>,
    ) -> Result<Self> {
        let client = CroupierClient::new(CroupierClientConfig {
            server_addr: control_addr,
            dangerous_skip_cert_verification: ca_pem.is_empty(),
            ca_pem,
            ..Default::default()
        })
        .map_err(|e| AgentError::dial(control_addr.to_string(), e))?;
        Ok(Self {
            agent_id: config.agent_id.clone(),
            game_id: config.game_id.clone(),
            env: config.env.clone(),
            region: config.region.clone(),
            zone: config.zone.clone(),
            labels: config.labels.clone(),
            advertise_addr: config.advertise_addr.clone(),
            control_addr,
            client,
            retry: RetryPolicy::default(),
            registry,
            assignments: RwLock::new(Vec::new()),
            session_id: Mutex::new(None),
            exposed: Mutex::new(Vec::new()),
        })
    }

    /// Currently assigned function ids, sorted. Empty means unrestricted.
    pub fn assignments(&self) -> Vec<String> {
        self.assignments
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Locally served function ids this agent should expose, honoring the
    /// assignment restriction.
    pub fn exposed_functions(&self) -> Vec<String> {
        let assignments = self.assignments.read().unwrap_or_else(|e| e.into_inner());
        let mut ids = self.registry.function_ids();
        if !assignments.is_empty() {
            ids.retain(|id| assignments.contains(id));
        }
        ids
    }

    /// Poll loop. Runs until the task is aborted.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = self.tick().await {
                warn!(addr = %self.control_addr, error = %err, "control plane sync failed");
            }
        }
    }

    /// One sync round: refresh assignments, then register or heartbeat.
    async fn tick(&self) -> Result<()> {
        self.fetch_assignments().await?;

        let exposed = self.exposed_functions();
        let session = self
            .session_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let registered = self.exposed.lock().unwrap_or_else(|e| e.into_inner()).clone();
        match session {
            Some(session_id) if registered == exposed => {
                match self.heartbeat(&session_id).await {
                    Ok(()) => Ok(()),
                    Err(AgentError::Control { code, message }) => {
                        info!(code = %code, message = %message, "heartbeat rejected, re-registering");
                        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
                        self.register(exposed).await
                    }
                    Err(err) => Err(err),
                }
            }
            _ => self.register(exposed).await,
        }
    }

    async fn fetch_assignments(&self) -> Result<()> {
        let response = self
            .call(rpc_request::Request::GetAssignments(GetAssignmentsRequest {
                game_id: self.game_id.clone(),
                env: self.env.clone(),
            }))
            .await?;
        match response {
            rpc_response::Response::GetAssignments(resp) => {
                let mut ids = resp.function_ids;
                ids.sort();
                *self.assignments.write().unwrap_or_else(|e| e.into_inner()) = ids;
                Ok(())
            }
            other => Err(AgentError::Control {
                code: "INTERNAL".to_string(),
                message: format!("unexpected assignments response: {:?}", other),
            }),
        }
    }

    async fn register(&self, exposed: Vec<String>) -> Result<()> {
        let functions = exposed
            .iter()
            .map(|id| {
                let (entity, operation) = id.split_once('.').unwrap_or((id.as_str(), ""));
                FunctionSpec {
                    id: id.clone(),
                    entity: entity.to_string(),
                    operation: operation.to_string(),
                    enabled: true,
                }
            })
            .collect();
        let response = self
            .call(rpc_request::Request::Register(RegisterRequest {
                agent_id: self.agent_id.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                rpc_addr: self.advertise_addr.clone(),
                game_id: self.game_id.clone(),
                env: self.env.clone(),
                region: self.region.clone(),
                zone: self.zone.clone(),
                labels: self.labels.clone(),
                functions,
            }))
            .await?;
        match response {
            rpc_response::Response::Register(resp) => {
                info!(
                    session_id = %resp.session_id,
                    functions = exposed.len(),
                    "registered with control plane"
                );
                *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) =
                    Some(resp.session_id);
                *self.exposed.lock().unwrap_or_else(|e| e.into_inner()) = exposed;
                Ok(())
            }
            other => Err(AgentError::Control {
                code: "INTERNAL".to_string(),
                message: format!("unexpected register response: {:?}", other),
            }),
        }
    }

    async fn heartbeat(&self, session_id: &str) -> Result<()> {
        let response = self
            .call(rpc_request::Request::Heartbeat(HeartbeatRequest {
                agent_id: self.agent_id.clone(),
                session_id: session_id.to_string(),
            }))
            .await?;
        match response {
            rpc_response::Response::Heartbeat(_) => {
                debug!(agent_id = %self.agent_id, "heartbeat acknowledged");
                Ok(())
            }
            other => Err(AgentError::Control {
                code: "INTERNAL".to_string(),
                message: format!("unexpected heartbeat response: {:?}", other),
            }),
        }
    }

    async fn call(&self, request: rpc_request::Request) -> Result<rpc_response::Response> {
        let wrapped = control::RpcRequest {
            request: Some(request),
        };
        let response: control::RpcResponse = self
            .client
            .request_with_retry(&wrapped, &self.retry)
            .await
            .map_err(|e| AgentError::dial(self.control_addr.to_string(), e))?;
        match response.response {
            Some(rpc_response::Response::Error(err)) => Err(AgentError::Control {
                code: err.code,
                message: err.message,
            }),
            Some(other) => Ok(other),
            None => Err(AgentError::Control {
                code: "INTERNAL".to_string(),
                message: "empty control response".to_string(),
            }),
        }
    }
}
