// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local-plane messages: SDK endpoint registration on the agent's loopback
//! listener.

use crate::common::RpcError;
use crate::function::{GetJobResultRequest, GetJobResultResponse, ListLocalRequest, ListLocalResponse};

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterLocalRequest {
    #[prost(string, tag = "1")]
    pub function_id: String,
    /// Stable id of the registering game service instance.
    #[prost(string, tag = "2")]
    pub service_id: String,
    /// Dialable address of the service's handler.
    #[prost(string, tag = "3")]
    pub addr: String,
    #[prost(string, tag = "4")]
    pub version: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterLocalResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocalHeartbeatRequest {
    #[prost(string, tag = "1")]
    pub service_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocalHeartbeatResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3, 4")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        RegisterLocal(super::RegisterLocalRequest),
        #[prost(message, tag = "2")]
        Heartbeat(super::LocalHeartbeatRequest),
        #[prost(message, tag = "3")]
        ListLocal(super::ListLocalRequest),
        #[prost(message, tag = "4")]
        GetJobResult(super::GetJobResultRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 4, 9")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        RegisterLocal(super::RegisterLocalResponse),
        #[prost(message, tag = "2")]
        Heartbeat(super::LocalHeartbeatResponse),
        #[prost(message, tag = "3")]
        ListLocal(super::ListLocalResponse),
        #[prost(message, tag = "4")]
        GetJobResult(super::GetJobResultResponse),
        #[prost(message, tag = "9")]
        Error(super::RpcError),
    }
}
