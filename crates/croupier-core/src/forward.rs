// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Edge-forward mode.
//!
//! When an edge address is configured the function plane stops routing and
//! relays every request to the edge gateway verbatim, metadata included. The
//! edge owns admission and agent selection in that topology; this tier only
//! terminates client QUIC.

use std::sync::Arc;

use croupier_proto::function::{self, JobEvent};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::Result;
use crate::router::AgentTransport;

/// Upstream name used for error attribution in relayed failures.
const EDGE_PEER: &str = "edge";

pub struct EdgeForwarder<T: AgentTransport> {
    transport: Arc<T>,
    edge_addr: String,
}

impl<T: AgentTransport> EdgeForwarder<T> {
    pub fn new(transport: Arc<T>, edge_addr: impl Into<String>) -> Self {
        Self {
            transport,
            edge_addr: edge_addr.into(),
        }
    }

    /// Relay one unary request. Transport failures come back as an `Error`
    /// response so callers see the same shape as in routing mode.
    pub async fn forward(&self, request: function::RpcRequest) -> function::RpcResponse {
        debug!(edge = %self.edge_addr, "forwarding function request");
        match self
            .transport
            .call(EDGE_PEER, &self.edge_addr, request)
            .await
        {
            Ok(response) => response,
            Err(err) => function::RpcResponse {
                response: Some(function::rpc_response::Response::Error(err.to_rpc_error())),
            },
        }
    }

    /// Relay a job event subscription.
    pub async fn stream_job(&self, job_id: &str) -> Result<mpsc::Receiver<JobEvent>> {
        self.transport
            .stream_job(EDGE_PEER, &self.edge_addr, job_id)
            .await
    }
}
