// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Croupier Edge - Tunnel Termination and Function Relay
//!
//! The edge is the regional middle hop between the core and agents that sit
//! behind NAT. Agents dial in and keep one long-lived reverse tunnel open;
//! operator traffic arriving on the function plane is correlated onto that
//! tunnel, or dialed directly when no tunnel is live.
//!
//! ```text
//! ┌──────────────────┐   function plane (7201)   ┌──────────────────┐
//! │  croupier-core   │ ────────────────────────▶ │  croupier-edge   │
//! │  (forward mode)  │                           │  tunnel + relay  │
//! └──────────────────┘                           └──────────────────┘
//!                                                  ▲ tunnel (7202)
//!                                                  │ agent-initiated
//!                                        ┌─────────┴────────┐
//!                                        │ Game-fleet agents │
//!                                        └──────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod relay;
pub mod server;
pub mod tunnel;

pub use error::TunnelError;
