// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tunnel-plane messages: the long-lived reverse stream between an agent and
//! an edge.
//!
//! The agent dials the edge, sends `Hello`, then both sides exchange
//! `TunnelMessage` frames on a single bidirectional stream. Requests flowing
//! edge→agent carry a `request_id` that the matching agent→edge reply echoes.

use std::collections::HashMap;

use crate::function::JobEvent;

/// First frame on every tunnel, agent→edge.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub agent_id: String,
    #[prost(string, tag = "2")]
    pub game_id: String,
    #[prost(string, tag = "3")]
    pub env: String,
    /// Advertised function-plane address, used for direct dialing when the
    /// tunnel is down.
    #[prost(string, tag = "4")]
    pub rpc_addr: String,
}

/// Edge→agent synchronous invocation.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct InvokeFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub function_id: String,
    #[prost(string, tag = "3")]
    pub idempotency_key: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(map = "string, string", tag = "5")]
    pub metadata: HashMap<String, String>,
}

/// Agent→edge reply to an `InvokeFrame`.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ResultFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
    /// Empty on success.
    #[prost(string, tag = "3")]
    pub error: String,
}

/// Edge→agent job start.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartJobFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub function_id: String,
    #[prost(string, tag = "3")]
    pub idempotency_key: String,
    #[prost(bytes = "vec", tag = "4")]
    pub payload: Vec<u8>,
    #[prost(map = "string, string", tag = "5")]
    pub metadata: HashMap<String, String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StartJobResult {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(string, tag = "3")]
    pub error: String,
}

/// Agent→edge job progress/terminal event, unsolicited.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobEventFrame {
    #[prost(string, tag = "1")]
    pub job_id: String,
    #[prost(message, optional, tag = "2")]
    pub event: Option<JobEvent>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(string, tag = "3")]
    pub reason: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelJobResult {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
    #[prost(bool, tag = "3")]
    pub cancelled: bool,
}

/// Agent→edge liveness signal, every 15 s.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeartbeatFrame {
    #[prost(string, tag = "1")]
    pub agent_id: String,
}

/// Edge→agent query for locally registered service ids.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLocalFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub function_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListLocalResult {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, repeated, tag = "2")]
    pub service_ids: Vec<String>,
}

/// Edge→agent query for a finished job's outcome.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobResultQuery {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(string, tag = "2")]
    pub job_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct JobResultFrame {
    #[prost(string, tag = "1")]
    pub request_id: String,
    #[prost(enumeration = "crate::function::JobState", tag = "2")]
    pub state: i32,
    #[prost(bytes = "vec", tag = "3")]
    pub payload: Vec<u8>,
    #[prost(string, tag = "4")]
    pub error: String,
}

/// Union of every frame that rides the tunnel, both directions.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TunnelMessage {
    #[prost(
        oneof = "tunnel_message::Msg",
        tags = "1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13"
    )]
    pub msg: Option<tunnel_message::Msg>,
}

pub mod tunnel_message {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Msg {
        #[prost(message, tag = "1")]
        Hello(super::Hello),
        #[prost(message, tag = "2")]
        Invoke(super::InvokeFrame),
        #[prost(message, tag = "3")]
        Result(super::ResultFrame),
        #[prost(message, tag = "4")]
        StartJob(super::StartJobFrame),
        #[prost(message, tag = "5")]
        StartJobResult(super::StartJobResult),
        #[prost(message, tag = "6")]
        JobEvent(super::JobEventFrame),
        #[prost(message, tag = "7")]
        CancelJob(super::CancelJobFrame),
        #[prost(message, tag = "8")]
        CancelJobResult(super::CancelJobResult),
        #[prost(message, tag = "9")]
        Heartbeat(super::HeartbeatFrame),
        #[prost(message, tag = "10")]
        ListLocal(super::ListLocalFrame),
        #[prost(message, tag = "11")]
        ListLocalResult(super::ListLocalResult),
        #[prost(message, tag = "12")]
        GetJobResult(super::JobResultQuery),
        #[prost(message, tag = "13")]
        JobResult(super::JobResultFrame),
    }
}

impl TunnelMessage {
    pub fn hello(
        agent_id: impl Into<String>,
        game_id: impl Into<String>,
        env: impl Into<String>,
        rpc_addr: impl Into<String>,
    ) -> Self {
        Self {
            msg: Some(tunnel_message::Msg::Hello(Hello {
                agent_id: agent_id.into(),
                game_id: game_id.into(),
                env: env.into(),
                rpc_addr: rpc_addr.into(),
            })),
        }
    }

    pub fn heartbeat(agent_id: impl Into<String>) -> Self {
        Self {
            msg: Some(tunnel_message::Msg::Heartbeat(HeartbeatFrame {
                agent_id: agent_id.into(),
            })),
        }
    }

    pub fn result(frame: ResultFrame) -> Self {
        Self {
            msg: Some(tunnel_message::Msg::Result(frame)),
        }
    }

    pub fn job_event(job_id: impl Into<String>, event: JobEvent) -> Self {
        Self {
            msg: Some(tunnel_message::Msg::JobEvent(JobEventFrame {
                job_id: job_id.into(),
                event: Some(event),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_hello_round_trip() {
        let msg = TunnelMessage::hello("agent-1", "poker", "prod", "10.0.0.4:7301");
        let decoded = TunnelMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        match decoded.msg {
            Some(tunnel_message::Msg::Hello(h)) => {
                assert_eq!(h.agent_id, "agent-1");
                assert_eq!(h.game_id, "poker");
                assert_eq!(h.env, "prod");
                assert_eq!(h.rpc_addr, "10.0.0.4:7301");
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_job_event_frame_round_trip() {
        let event = JobEvent {
            r#type: crate::function::JobEventType::Done as i32,
            progress: 100,
            message: String::new(),
            payload: b"{}".to_vec(),
        };
        let msg = TunnelMessage::job_event("job-1", event);
        let decoded = TunnelMessage::decode(msg.encode_to_vec().as_slice()).unwrap();
        match decoded.msg {
            Some(tunnel_message::Msg::JobEvent(f)) => {
                assert_eq!(f.job_id, "job-1");
                assert!(f.event.unwrap().is_terminal());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_every_variant_survives_reencode() {
        let variants = vec![
            TunnelMessage::hello("a", "g", "e", "127.0.0.1:7301"),
            TunnelMessage {
                msg: Some(tunnel_message::Msg::Invoke(InvokeFrame {
                    request_id: "r1".to_string(),
                    function_id: "f".to_string(),
                    idempotency_key: String::new(),
                    payload: Vec::new(),
                    metadata: HashMap::new(),
                })),
            },
            TunnelMessage::result(ResultFrame {
                request_id: "r1".to_string(),
                payload: b"ok".to_vec(),
                error: String::new(),
            }),
            TunnelMessage::heartbeat("a"),
            TunnelMessage {
                msg: Some(tunnel_message::Msg::GetJobResult(JobResultQuery {
                    request_id: "r2".to_string(),
                    job_id: "j1".to_string(),
                })),
            },
        ];
        for v in variants {
            let decoded = TunnelMessage::decode(v.encode_to_vec().as_slice()).unwrap();
            assert_eq!(v, decoded);
        }
    }
}
