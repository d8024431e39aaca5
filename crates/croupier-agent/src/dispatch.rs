// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Fan-out to local SDK endpoints.
//!
//! The executor and the tunnel client call through this seam; tests swap in
//! a mock. The production dispatcher picks an endpoint from the local
//! registry and relays the invocation over pooled QUIC.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use croupier_core::pool::{ConnectionPool, QuicDialer};
use croupier_proto::function::{self, InvokeRequest, rpc_request, rpc_response};
use tracing::debug;

use crate::error::{AgentError, Result};
use crate::local::LocalRegistry;

/// Performs one local invocation and returns the result payload.
#[async_trait]
pub trait LocalDispatch: Send + Sync + 'static {
    async fn invoke(
        &self,
        function_id: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<Vec<u8>>;
}

/// Dispatches over pooled QUIC connections to registered SDK endpoints.
pub struct QuicLocalDispatch {
    registry: Arc<LocalRegistry>,
    pool: Arc<ConnectionPool<QuicDialer>>,
}

impl QuicLocalDispatch {
    pub fn new(registry: Arc<LocalRegistry>, pool: Arc<ConnectionPool<QuicDialer>>) -> Self {
        Self { registry, pool }
    }
}

#[async_trait]
impl LocalDispatch for QuicLocalDispatch {
    async fn invoke(
        &self,
        function_id: &str,
        payload: &[u8],
        metadata: &HashMap<String, String>,
    ) -> Result<Vec<u8>> {
        // A targeted invocation names the exact service instance; everything
        // else rotates over the live endpoints.
        let target = metadata
            .get("target_service_id")
            .filter(|s| !s.is_empty() && metadata.get("route").map(String::as_str) == Some("targeted"));
        let endpoint = match target {
            Some(service_id) => self.registry.pick_service(function_id, service_id),
            None => self.registry.pick(function_id),
        }
        .ok_or_else(|| AgentError::NoLocalEndpoint(function_id.to_string()))?;
        debug!(
            function_id = %function_id,
            service_id = %endpoint.service_id,
            addr = %endpoint.addr,
            "dispatching to local endpoint"
        );

        let client = self
            .pool
            .get(&endpoint.addr)
            .await
            .map_err(|e| AgentError::dial(&endpoint.addr, e))?;
        let request = function::RpcRequest {
            request: Some(rpc_request::Request::Invoke(InvokeRequest {
                function_id: function_id.to_string(),
                payload: payload.to_vec(),
                idempotency_key: String::new(),
                metadata: metadata.clone(),
            })),
        };
        let response: function::RpcResponse = client
            .request(&request)
            .await
            .map_err(|e| AgentError::dial(&endpoint.addr, e))?;
        match response.response {
            Some(rpc_response::Response::Invoke(resp)) => Ok(resp.payload),
            Some(rpc_response::Response::Error(err)) => Err(AgentError::LocalCall {
                function_id: function_id.to_string(),
                reason: format!("{}: {}", err.code, err.message),
            }),
            _ => Err(AgentError::LocalCall {
                function_id: function_id.to_string(),
                reason: "unexpected response variant".to_string(),
            }),
        }
    }
}
