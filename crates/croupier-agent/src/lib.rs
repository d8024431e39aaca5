// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier agent: the tier that runs next to a game fleet.
//!
//! ```text
//!                    direct dial (function plane, :7301)
//!   core / edge  ──────────────────────────────────────►  agent
//!        ▲                                                  │
//!        │  reverse tunnel (agent dials edge :7202)         │ local plane (:7302)
//!        └──────────────────────────────────────────────    ▼
//!                                                     game services (SDK)
//! ```
//!
//! Game services register the functions they implement on the loopback local
//! plane. Invocations arrive either over the function plane (direct dial) or
//! over the reverse tunnel, and fan out round-robin to the registered
//! endpoints. Long-running invocations become jobs with progress events.

pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod local;
pub mod server;
pub mod tunnel;

pub use error::AgentError;
