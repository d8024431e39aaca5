// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for croupier-core.
//!
//! Provides a unified error type that maps to RPC error responses with
//! stable machine-readable codes.

use croupier_proto::common::RpcError;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur during request processing.
#[derive(Debug, Clone, thiserror::Error)]
#[non_exhaustive]
pub enum CoreError {
    /// The function id is not present in the loaded descriptor pack.
    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    /// The payload failed descriptor schema validation.
    #[error("invalid payload for '{function_id}': field '{field}': {reason}")]
    PayloadInvalid {
        function_id: String,
        field: String,
        reason: String,
    },

    /// The request is malformed (missing metadata, bad arguments).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Policy denied the call outright.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The two-person rule needs more approvals.
    #[error("requires approval: {0}")]
    RequiresApproval(String),

    /// The risk level demands a verified MFA session.
    #[error("requires MFA: {0}")]
    RequiresMfa(String),

    /// The call arrived outside the permitted time window.
    #[error("outside allowed window: {0}")]
    OutOfWindow(String),

    /// No live agent serves this function in this scope.
    #[error("no agent available for '{0}'")]
    NoAgentAvailable(String),

    /// Targeted routing found no agent hosting the requested service id.
    #[error("target service '{0}' not found")]
    TargetNotFound(String),

    /// The job id is neither active nor cached anywhere we can see.
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    /// The per-agent token bucket is empty.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The connection pool is at capacity for this target.
    #[error("too many connections to '{0}'")]
    TooManyConnections(String),

    /// The connection pool has been shut down.
    #[error("connection pool closed")]
    PoolClosed,

    /// Dialing the agent failed before any request was sent.
    #[error("dial failure for '{addr}': {reason}")]
    DialFailure { addr: String, reason: String },

    /// A tunnel correlation deadline elapsed without a reply.
    #[error("tunnel timeout: {0}")]
    TunnelTimeout(String),

    /// The agent was reached but the transport failed mid-call.
    #[error("agent '{agent_id}' unreachable: {reason}")]
    UpstreamUnavailable { agent_id: String, reason: String },

    /// The agent returned an application-level error.
    #[error("agent '{agent_id}' error: {code}: {message}")]
    UpstreamError {
        agent_id: String,
        code: String,
        message: String,
    },

    /// Anything that should not leak internals to the caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Convert this error to an RpcError for protocol responses.
    pub fn to_rpc_error(&self) -> RpcError {
        RpcError {
            code: self.error_code().to_string(),
            message: self.to_string(),
        }
    }

    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownFunction(_) => "UNKNOWN_FUNCTION",
            Self::PayloadInvalid { .. } => "PAYLOAD_INVALID",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::RequiresApproval(_) => "REQUIRES_APPROVAL",
            Self::RequiresMfa(_) => "REQUIRES_MFA",
            Self::OutOfWindow(_) => "OUT_OF_WINDOW",
            Self::NoAgentAvailable(_) => "NO_AGENT_AVAILABLE",
            Self::TargetNotFound(_) => "TARGET_NOT_FOUND",
            Self::UnknownJob(_) => "UNKNOWN_JOB",
            Self::RateLimited(_) => "RATE_LIMITED",
            Self::TooManyConnections(_) => "TOO_MANY_CONNECTIONS",
            Self::PoolClosed => "TOO_MANY_CONNECTIONS",
            Self::DialFailure { .. } => "DIAL_FAILURE",
            Self::TunnelTimeout(_) => "TUNNEL_TIMEOUT",
            Self::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            Self::UpstreamError { .. } => "UPSTREAM_ERROR",
            Self::Internal(_) => "INTERNAL",
        }
    }

    /// True for transport-level failures that should demote agent health
    /// and count against `failed_requests`.
    pub fn is_transport_failure(&self) -> bool {
        matches!(
            self,
            Self::DialFailure { .. } | Self::UpstreamUnavailable { .. } | Self::TunnelTimeout(_)
        )
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {}", err))
    }
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Internal(format!("io: {}", err))
    }
}
