// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function-plane messages: invocations and job operations.
//!
//! The same surface is served by the core (routing tier), the edge (relay)
//! and the agent (terminal executor), so callers are oblivious to which tier
//! they dialed.

use std::collections::HashMap;

use crate::common::RpcError;

/// Kind of a streamed job event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobEventType {
    Progress = 0,
    Done = 1,
    Error = 2,
}

/// Lifecycle state of a job as reported by `GetJobResult`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum JobState {
    Running = 0,
    Done = 1,
    Error = 2,
    Cancelled = 3,
    /// Neither active nor cached; the id may be bogus or expired.
    Unknown = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeRequest {
    #[prost(string, tag = "1")]
    pub function_id: String,
    /// Opaque payload, validated against the descriptor schema upstream.
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "3")]
    pub idempotency_key: String,
    /// Routing and identity hints: `game_id`, `env`, `route`,
    /// `target_service_id`, `hash_key`, `actor`, `roles`, `mfa_verified`.
    #[prost(map = "string, string", tag = "4")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeResponse {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
    /// Agent that executed the call.
    #[prost(string, tag = "2")]
    pub agent_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartJobResponse {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub agent_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobStreamRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

/// One element of a job event stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobEvent {
    #[prost(enumeration = "JobEventType", tag = "1")]
    pub r#type: i32,
    /// 0..=100, meaningful for progress events only.
    #[prost(int32, tag = "2")]
    pub progress: i32,
    #[prost(string, tag = "3")]
    pub message: String,
    /// Result payload on `Done`, empty otherwise.
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
}

impl JobEvent {
    pub fn event_type(&self) -> JobEventType {
        JobEventType::try_from(self.r#type).unwrap_or(JobEventType::Progress)
    }

    /// Done and Error events end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type(), JobEventType::Done | JobEventType::Error)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(string, tag = "2")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobResponse {
    #[prost(bool, tag = "1")]
    pub cancelled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobResultRequest {
    #[prost(string, tag = "1")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetJobResultResponse {
    #[prost(enumeration = "JobState", tag = "1")]
    pub state: i32,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "3")]
    pub error: String,
}

impl GetJobResultResponse {
    pub fn job_state(&self) -> JobState {
        JobState::try_from(self.state).unwrap_or(JobState::Unknown)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLocalRequest {
    #[prost(string, tag = "1")]
    pub function_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLocalResponse {
    #[prost(string, repeated, tag = "1")]
    pub service_ids: Vec<String>,
}

/// Function-plane request wrapper, one per QUIC stream.
///
/// `StreamJob` answers with a `StreamStart`/`StreamData*`/`StreamEnd`
/// sequence instead of a single `RpcResponse`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4, 5, 6")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Invoke(super::InvokeRequest),
        #[prost(message, tag = "2")]
        StartJob(super::InvokeRequest),
        #[prost(message, tag = "3")]
        StreamJob(super::JobStreamRequest),
        #[prost(message, tag = "4")]
        CancelJob(super::CancelJobRequest),
        #[prost(message, tag = "5")]
        GetJobResult(super::GetJobResultRequest),
        #[prost(message, tag = "6")]
        ListLocal(super::ListLocalRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 4, 5, 6, 9")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Invoke(super::InvokeResponse),
        #[prost(message, tag = "2")]
        StartJob(super::StartJobResponse),
        #[prost(message, tag = "4")]
        CancelJob(super::CancelJobResponse),
        #[prost(message, tag = "5")]
        GetJobResult(super::GetJobResultResponse),
        #[prost(message, tag = "6")]
        ListLocal(super::ListLocalResponse),
        #[prost(message, tag = "9")]
        Error(super::RpcError),
    }
}
