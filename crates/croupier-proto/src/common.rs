// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages shared across planes.

/// Typed RPC error carried in `Response::Error` variants.
///
/// `code` is one of the stable machine-readable codes (`UNKNOWN_FUNCTION`,
/// `RATE_LIMITED`, ...); `message` is human-readable context.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcError {
    #[prost(string, tag = "1")]
    pub code: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl RpcError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
