// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire protocol layer for croupier.
//!
//! Four message planes ride the same frame format:
//! - `control`: agent registration, heartbeats, assignment polling
//! - `function`: invocations and job operations against the routing tier
//! - `local`: SDK endpoint registration on the agent's loopback listener
//! - `tunnel`: the long-lived reverse stream between an agent and an edge
//!
//! [`client`] and [`server`] wrap quinn endpoints so the binaries only deal
//! in typed frames.

pub mod client;
pub mod common;
pub mod control;
pub mod frame;
pub mod function;
pub mod local;
pub mod server;
pub mod tunnel;

pub use client::{CroupierClient, CroupierClientConfig, ClientError, RetryPolicy};
pub use frame::{Frame, FrameError, FramedStream, MessageType};
pub use server::{ConnectionHandler, CroupierServer, CroupierServerConfig, ServerError, StreamHandler};
