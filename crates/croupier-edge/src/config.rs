// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Croupier edge configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Function-plane QUIC address (relayed invocations and jobs)
    pub function_addr: SocketAddr,
    /// Tunnel QUIC address agents dial in on
    pub tunnel_addr: SocketAddr,
    /// TLS certificate chain path (PEM); absent means self-signed dev cert
    pub tls_cert_path: Option<PathBuf>,
    /// TLS private key path (PEM)
    pub tls_key_path: Option<PathBuf>,
    /// CA bundle path for verifying agent server certs on direct dials;
    /// absent means dial without verification (dev only)
    pub agent_ca_path: Option<PathBuf>,
    /// Static agent_id → rpc_addr entries for the direct-dial fallback
    pub fallback_addrs: HashMap<String, String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// All optional (with defaults):
    /// - `CROUPIER_EDGE_FUNCTION_PORT`: function-plane port (default: 7201)
    /// - `CROUPIER_EDGE_TUNNEL_PORT`: tunnel port (default: 7202)
    /// - `CROUPIER_EDGE_TLS_CERT` / `CROUPIER_EDGE_TLS_KEY`: TLS material
    /// - `CROUPIER_EDGE_AGENT_CA`: CA bundle for verifying dialed agents
    /// - `CROUPIER_EDGE_FALLBACK_ADDRS`: comma list of `agent_id=host:port`
    pub fn from_env() -> Result<Self, ConfigError> {
        let function_port: u16 = std::env::var("CROUPIER_EDGE_FUNCTION_PORT")
            .unwrap_or_else(|_| "7201".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_EDGE_FUNCTION_PORT", "must be a valid port number")
            })?;

        let tunnel_port: u16 = std::env::var("CROUPIER_EDGE_TUNNEL_PORT")
            .unwrap_or_else(|_| "7202".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_EDGE_TUNNEL_PORT", "must be a valid port number")
            })?;

        let mut fallback_addrs = HashMap::new();
        if let Ok(raw) = std::env::var("CROUPIER_EDGE_FALLBACK_ADDRS") {
            for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
                let (agent_id, addr) = pair.trim().split_once('=').ok_or(ConfigError::Invalid(
                    "CROUPIER_EDGE_FALLBACK_ADDRS",
                    "entries must look like agent_id=host:port",
                ))?;
                if agent_id.is_empty() || addr.is_empty() {
                    return Err(ConfigError::Invalid(
                        "CROUPIER_EDGE_FALLBACK_ADDRS",
                        "entries must look like agent_id=host:port",
                    ));
                }
                fallback_addrs.insert(agent_id.to_string(), addr.to_string());
            }
        }

        Ok(Self {
            function_addr: SocketAddr::from(([0, 0, 0, 0], function_port)),
            tunnel_addr: SocketAddr::from(([0, 0, 0, 0], tunnel_port)),
            tls_cert_path: std::env::var("CROUPIER_EDGE_TLS_CERT")
                .ok()
                .map(PathBuf::from),
            tls_key_path: std::env::var("CROUPIER_EDGE_TLS_KEY")
                .ok()
                .map(PathBuf::from),
            agent_ca_path: std::env::var("CROUPIER_EDGE_AGENT_CA")
                .ok()
                .map(PathBuf::from),
            fallback_addrs,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
