// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Croupier agent configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Stable agent identity; generated when not configured
    pub agent_id: String,
    /// Game fleet this agent belongs to
    pub game_id: String,
    /// Environment (prod, staging, ...)
    pub env: String,
    pub region: String,
    pub zone: String,
    /// Free-form labels advertised at registration (weight lives here)
    pub labels: HashMap<String, String>,
    /// Function-plane QUIC bind address (edge/core dial this directly)
    pub rpc_addr: SocketAddr,
    /// Address advertised to the control plane and in the tunnel hello
    pub advertise_addr: String,
    /// Local control plane for SDK registrations (loopback)
    pub local_addr: SocketAddr,
    /// Core control plane to register with; absent in edge-only topologies
    pub control_addr: Option<SocketAddr>,
    /// Edge tunnel address to dial; absent when the core routes directly
    pub tunnel_addr: Option<SocketAddr>,
    /// CA bundle for verifying the dialed core/edge; absent means
    /// skip-verify (dev only)
    pub ca_path: Option<PathBuf>,
    /// TLS material for the agent's own listeners; absent means self-signed
    pub tls_cert_path: Option<PathBuf>,
    pub tls_key_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CROUPIER_AGENT_GAME`: game fleet id
    ///
    /// Optional (with defaults):
    /// - `CROUPIER_AGENT_ID`: agent identity (default: generated)
    /// - `CROUPIER_AGENT_ENV`: environment (default: prod)
    /// - `CROUPIER_AGENT_REGION` / `CROUPIER_AGENT_ZONE`
    /// - `CROUPIER_AGENT_RPC_PORT`: function-plane port (default: 7301)
    /// - `CROUPIER_AGENT_ADVERTISE_ADDR`: dialable address others use
    ///   (default: 127.0.0.1:<rpc port>)
    /// - `CROUPIER_AGENT_LOCAL_PORT`: SDK control port (default: 7302)
    /// - `CROUPIER_AGENT_CONTROL_ADDR`: core control plane
    /// - `CROUPIER_AGENT_TUNNEL_ADDR`: edge tunnel
    /// - `CROUPIER_AGENT_CA`: CA bundle for upstream verification
    /// - `CROUPIER_AGENT_TLS_CERT` / `CROUPIER_AGENT_TLS_KEY`
    pub fn from_env() -> Result<Self, ConfigError> {
        let game_id = std::env::var("CROUPIER_AGENT_GAME")
            .map_err(|_| ConfigError::Missing("CROUPIER_AGENT_GAME"))?;

        let agent_id = std::env::var("CROUPIER_AGENT_ID")
            .unwrap_or_else(|_| format!("agent-{}", uuid::Uuid::new_v4()));

        let rpc_port: u16 = std::env::var("CROUPIER_AGENT_RPC_PORT")
            .unwrap_or_else(|_| "7301".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_AGENT_RPC_PORT", "must be a valid port number")
            })?;

        let local_port: u16 = std::env::var("CROUPIER_AGENT_LOCAL_PORT")
            .unwrap_or_else(|_| "7302".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_AGENT_LOCAL_PORT", "must be a valid port number")
            })?;

        let advertise_addr = std::env::var("CROUPIER_AGENT_ADVERTISE_ADDR")
            .unwrap_or_else(|_| format!("127.0.0.1:{}", rpc_port));

        let control_addr = match std::env::var("CROUPIER_AGENT_CONTROL_ADDR") {
            Ok(v) => Some(v.parse().map_err(|_| {
                ConfigError::Invalid("CROUPIER_AGENT_CONTROL_ADDR", "must be a socket address")
            })?),
            Err(_) => None,
        };

        let tunnel_addr = match std::env::var("CROUPIER_AGENT_TUNNEL_ADDR") {
            Ok(v) => Some(v.parse().map_err(|_| {
                ConfigError::Invalid("CROUPIER_AGENT_TUNNEL_ADDR", "must be a socket address")
            })?),
            Err(_) => None,
        };

        let mut labels = HashMap::new();
        if let Ok(raw) = std::env::var("CROUPIER_AGENT_LABELS") {
            for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
                let (key, value) = pair.trim().split_once('=').ok_or(ConfigError::Invalid(
                    "CROUPIER_AGENT_LABELS",
                    "entries must look like key=value",
                ))?;
                labels.insert(key.to_string(), value.to_string());
            }
        }

        Ok(Self {
            agent_id,
            game_id,
            env: std::env::var("CROUPIER_AGENT_ENV").unwrap_or_else(|_| "prod".to_string()),
            region: std::env::var("CROUPIER_AGENT_REGION").unwrap_or_default(),
            zone: std::env::var("CROUPIER_AGENT_ZONE").unwrap_or_default(),
            labels,
            rpc_addr: SocketAddr::from(([0, 0, 0, 0], rpc_port)),
            advertise_addr,
            local_addr: SocketAddr::from(([127, 0, 0, 1], local_port)),
            control_addr,
            tunnel_addr,
            ca_path: std::env::var("CROUPIER_AGENT_CA").ok().map(PathBuf::from),
            tls_cert_path: std::env::var("CROUPIER_AGENT_TLS_CERT")
                .ok()
                .map(PathBuf::from),
            tls_key_path: std::env::var("CROUPIER_AGENT_TLS_KEY")
                .ok()
                .map(PathBuf::from),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
