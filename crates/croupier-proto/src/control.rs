// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control-plane messages: agent registration, heartbeats, assignment polling.

use std::collections::HashMap;

use crate::common::RpcError;

/// One function exposed by a registering agent.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FunctionSpec {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(string, tag = "2")]
    pub entity: String,
    #[prost(string, tag = "3")]
    pub operation: String,
    #[prost(bool, tag = "4")]
    pub enabled: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub version: String,
    /// Dialable function-plane address of the agent.
    #[prost(string, tag = "3")]
    pub rpc_addr: String,
    #[prost(string, tag = "4")]
    pub game_id: String,
    #[prost(string, tag = "5")]
    pub env: String,
    #[prost(string, tag = "6")]
    pub region: String,
    #[prost(string, tag = "7")]
    pub zone: String,
    #[prost(map = "string, string", tag = "8")]
    pub labels: HashMap<String, String>,
    #[prost(message, repeated, tag = "9")]
    pub functions: Vec<FunctionSpec>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterResponse {
    #[prost(string, tag = "1")]
    pub session_id: String,
    /// Lease expiry, unix seconds.
    #[prost(int64, tag = "2")]
    pub expire_at: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatRequest {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatResponse {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAssignmentsRequest {
    #[prost(string, tag = "1")]
    pub game_id: String,
    #[prost(string, tag = "2")]
    pub env: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GetAssignmentsResponse {
    /// Assigned function ids in declaration order. Empty means no restriction.
    #[prost(string, repeated, tag = "1")]
    pub function_ids: Vec<String>,
}

/// Control-plane request wrapper, one per QUIC stream.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcRequest {
    #[prost(oneof = "rpc_request::Request", tags = "1, 2, 3")]
    pub request: Option<rpc_request::Request>,
}

pub mod rpc_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Request {
        #[prost(message, tag = "1")]
        Register(super::RegisterRequest),
        #[prost(message, tag = "2")]
        Heartbeat(super::HeartbeatRequest),
        #[prost(message, tag = "3")]
        GetAssignments(super::GetAssignmentsRequest),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RpcResponse {
    #[prost(oneof = "rpc_response::Response", tags = "1, 2, 3, 9")]
    pub response: Option<rpc_response::Response>,
}

pub mod rpc_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Response {
        #[prost(message, tag = "1")]
        Register(super::RegisterResponse),
        #[prost(message, tag = "2")]
        Heartbeat(super::HeartbeatResponse),
        #[prost(message, tag = "3")]
        GetAssignments(super::GetAssignmentsResponse),
        #[prost(message, tag = "9")]
        Error(super::RpcError),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_register_round_trip() {
        let req = RegisterRequest {
            agent_id: "agent-eu-1".to_string(),
            version: "0.3.0".to_string(),
            rpc_addr: "10.0.0.5:7301".to_string(),
            game_id: "poker".to_string(),
            env: "prod".to_string(),
            region: "eu-west".to_string(),
            zone: "eu-west-1a".to_string(),
            labels: HashMap::from([("rack".to_string(), "r12".to_string())]),
            functions: vec![FunctionSpec {
                id: "table.close".to_string(),
                entity: "table".to_string(),
                operation: "close".to_string(),
                enabled: true,
            }],
        };

        let wrapped = RpcRequest {
            request: Some(rpc_request::Request::Register(req.clone())),
        };
        let bytes = wrapped.encode_to_vec();
        let decoded = RpcRequest::decode(bytes.as_slice()).unwrap();

        match decoded.request {
            Some(rpc_request::Request::Register(r)) => {
                assert_eq!(r.agent_id, "agent-eu-1");
                assert_eq!(r.functions.len(), 1);
                assert_eq!(r.functions[0].entity, "table");
                assert_eq!(r.labels.get("rack").map(String::as_str), Some("r12"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_error_response_round_trip() {
        let resp = RpcResponse {
            response: Some(rpc_response::Response::Error(RpcError::new(
                "FORBIDDEN",
                "game poker not allowed in env prod",
            ))),
        };
        let decoded = RpcResponse::decode(resp.encode_to_vec().as_slice()).unwrap();
        match decoded.response {
            Some(rpc_response::Response::Error(e)) => assert_eq!(e.code, "FORBIDDEN"),
            other => panic!("unexpected variant: {:?}", other),
        }
    }
}
