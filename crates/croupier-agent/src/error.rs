// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for croupier-agent.

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentError {
    /// Dialing an upstream (edge, core, or a local SDK endpoint) failed.
    #[error("dial failure for '{addr}': {reason}")]
    Dial { addr: String, reason: String },

    /// The tunnel session broke or was rejected.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// The control plane answered with an error.
    #[error("control plane error: {code}: {message}")]
    Control { code: String, message: String },

    /// No live SDK endpoint is registered for this function.
    #[error("no local endpoint for '{0}'")]
    NoLocalEndpoint(String),

    /// A local SDK call failed.
    #[error("local call for '{function_id}' failed: {reason}")]
    LocalCall {
        function_id: String,
        reason: String,
    },

    /// The job id is neither active nor in the terminal cache.
    #[error("unknown job '{0}'")]
    UnknownJob(String),
}

impl AgentError {
    pub fn dial(addr: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Dial {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Stable wire code for this error.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Dial { .. } => "DIAL_FAILURE",
            Self::Tunnel(_) => "UPSTREAM_UNAVAILABLE",
            Self::Control { code, .. } => code,
            Self::NoLocalEndpoint(_) => "TARGET_NOT_FOUND",
            Self::LocalCall { .. } => "UPSTREAM_ERROR",
            Self::UnknownJob(_) => "UNKNOWN_JOB",
        }
    }

    pub fn to_rpc_error(&self) -> croupier_proto::common::RpcError {
        croupier_proto::common::RpcError::new(self.error_code(), self.to_string())
    }
}
