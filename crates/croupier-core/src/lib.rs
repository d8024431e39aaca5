// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier Core - Control Plane and Function Router
//!
//! This crate is the middle tier of the croupier stack. Agents register here
//! and keep their leases alive over the control plane; operator clients
//! invoke descriptor-governed functions over the function plane, which
//! validates, authorizes, audits and then routes each call to a live agent.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Operator Clients                        │
//! │                 (consoles, CLIs, tooling)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ function plane (port 7102)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     croupier-core                           │
//! │        descriptors → assignments → policy → audit           │
//! │                 → balancer → rate gate → router             │
//! └─────────────────────────────────────────────────────────────┘
//!        ▲ control plane (port 7101)        │ pooled QUIC dials
//!        │                                  ▼
//! ┌──────────────────┐          ┌───────────────────────────────┐
//! │  Agent register/ │          │        Game-fleet agents      │
//! │  heartbeat/poll  │          │     (croupier-agent, 7301)    │
//! └──────────────────┘          └───────────────────────────────┘
//! ```
//!
//! With `CROUPIER_EDGE_ADDR` set the function plane relays to an edge
//! gateway instead of routing locally; agents behind NAT reach that edge
//! through a reverse tunnel.

pub mod allow_if;
pub mod approvals;
pub mod assignments;
pub mod audit;
pub mod balancer;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod forward;
pub mod games;
pub mod handlers;
pub mod limiter;
pub mod policy;
pub mod pool;
pub mod registry;
pub mod router;
pub mod server;
pub mod stats;

pub use error::{CoreError, Result};
