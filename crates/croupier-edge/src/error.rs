// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunnel-layer errors.
//!
//! These cover the lifecycle of a correlated request on the reverse tunnel.
//! The relay converts them into `CoreError` so callers see the same stable
//! codes in both the tunneled and direct-dial paths.

use croupier_core::CoreError;

pub type Result<T> = std::result::Result<T, TunnelError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TunnelError {
    /// No live tunnel for this agent.
    #[error("agent '{0}' has no live tunnel")]
    AgentNotConnected(String),

    /// A second tunnel greeted with an agent id that is already connected.
    #[error("agent '{0}' already has a live tunnel")]
    DuplicateAgent(String),

    /// The correlation deadline elapsed without a reply.
    #[error("request '{request_id}' to agent '{agent_id}' timed out")]
    Timeout {
        agent_id: String,
        request_id: String,
    },

    /// The tunnel dropped while a reply was pending.
    #[error("tunnel to agent '{agent_id}' closed while request '{request_id}' was pending")]
    ClosedWhilePending {
        agent_id: String,
        request_id: String,
    },

    /// The agent echoed the request id on a frame of the wrong kind.
    #[error("agent '{agent_id}' answered request '{request_id}' with an unexpected frame")]
    UnexpectedReply {
        agent_id: String,
        request_id: String,
    },
}

impl From<TunnelError> for CoreError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::AgentNotConnected(agent_id) => CoreError::UpstreamUnavailable {
                agent_id,
                reason: "no live tunnel".to_string(),
            },
            TunnelError::DuplicateAgent(agent_id) => {
                CoreError::BadRequest(format!("agent '{}' already has a live tunnel", agent_id))
            }
            TunnelError::Timeout {
                agent_id,
                request_id,
            } => CoreError::TunnelTimeout(format!(
                "request '{}' to agent '{}'",
                request_id, agent_id
            )),
            TunnelError::ClosedWhilePending {
                agent_id,
                request_id,
            } => CoreError::UpstreamUnavailable {
                agent_id,
                reason: format!("tunnel closed while request '{}' was pending", request_id),
            },
            TunnelError::UnexpectedReply {
                agent_id,
                request_id,
            } => CoreError::Internal(format!(
                "agent '{}' answered request '{}' with an unexpected frame",
                agent_id, request_id
            )),
        }
    }
}
