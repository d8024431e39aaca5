// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Croupier core configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane QUIC address (agent registration, heartbeats)
    pub control_addr: SocketAddr,
    /// Function-plane QUIC address (invocations, jobs)
    pub function_addr: SocketAddr,
    /// Directory of JSON function descriptors
    pub pack_dir: PathBuf,
    /// RBAC policy file (JSON); absent means allow-nothing beyond wildcards
    pub policy_path: Option<PathBuf>,
    /// Append-only audit log path
    pub audit_path: PathBuf,
    /// Balancing strategy: round_robin, weighted, least_conn, consistent_hash
    pub balancer: String,
    /// When set, the function plane forwards to this edge instead of routing
    pub edge_addr: Option<SocketAddr>,
    /// TLS certificate chain path (PEM); absent means self-signed dev cert
    pub tls_cert_path: Option<PathBuf>,
    /// TLS private key path (PEM)
    pub tls_key_path: Option<PathBuf>,
    /// Client CA bundle path enabling mTLS on the function plane
    pub client_ca_path: Option<PathBuf>,
    /// CA bundle path for verifying agent server certs when dialing; absent
    /// means dial without verification (dev only)
    pub agent_ca_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `CROUPIER_PACK_DIR`: directory of function descriptors
    ///
    /// Optional (with defaults):
    /// - `CROUPIER_CONTROL_PORT`: control-plane port (default: 7101)
    /// - `CROUPIER_FUNCTION_PORT`: function-plane port (default: 7102)
    /// - `CROUPIER_POLICY_FILE`: RBAC policy JSON file
    /// - `CROUPIER_AUDIT_LOG`: audit log path (default: croupier-audit.log)
    /// - `CROUPIER_BALANCER`: balancing strategy (default: round_robin)
    /// - `CROUPIER_EDGE_ADDR`: edge address enabling forward mode
    /// - `CROUPIER_TLS_CERT` / `CROUPIER_TLS_KEY`: server TLS material
    /// - `CROUPIER_CLIENT_CA`: CA bundle for function-plane client certs
    /// - `CROUPIER_AGENT_CA`: CA bundle for verifying dialed agents
    pub fn from_env() -> Result<Self, ConfigError> {
        let pack_dir = std::env::var("CROUPIER_PACK_DIR")
            .map(PathBuf::from)
            .map_err(|_| ConfigError::Missing("CROUPIER_PACK_DIR"))?;

        let control_port: u16 = std::env::var("CROUPIER_CONTROL_PORT")
            .unwrap_or_else(|_| "7101".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_CONTROL_PORT", "must be a valid port number")
            })?;

        let function_port: u16 = std::env::var("CROUPIER_FUNCTION_PORT")
            .unwrap_or_else(|_| "7102".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("CROUPIER_FUNCTION_PORT", "must be a valid port number")
            })?;

        let balancer = std::env::var("CROUPIER_BALANCER")
            .unwrap_or_else(|_| "round_robin".to_string());
        match balancer.as_str() {
            "round_robin" | "weighted" | "least_conn" | "consistent_hash" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "CROUPIER_BALANCER",
                    "must be one of: round_robin, weighted, least_conn, consistent_hash",
                ));
            }
        }

        let edge_addr = match std::env::var("CROUPIER_EDGE_ADDR") {
            Ok(v) => Some(v.parse().map_err(|_| {
                ConfigError::Invalid("CROUPIER_EDGE_ADDR", "must be a socket address")
            })?),
            Err(_) => None,
        };

        Ok(Self {
            control_addr: SocketAddr::from(([0, 0, 0, 0], control_port)),
            function_addr: SocketAddr::from(([0, 0, 0, 0], function_port)),
            pack_dir,
            policy_path: std::env::var("CROUPIER_POLICY_FILE").ok().map(PathBuf::from),
            audit_path: std::env::var("CROUPIER_AUDIT_LOG")
                .unwrap_or_else(|_| "croupier-audit.log".to_string())
                .into(),
            balancer,
            edge_addr,
            tls_cert_path: std::env::var("CROUPIER_TLS_CERT").ok().map(PathBuf::from),
            tls_key_path: std::env::var("CROUPIER_TLS_KEY").ok().map(PathBuf::from),
            client_ca_path: std::env::var("CROUPIER_CLIENT_CA").ok().map(PathBuf::from),
            agent_ca_path: std::env::var("CROUPIER_AGENT_CA").ok().map(PathBuf::from),
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

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    fn clear_optional(guard: &mut EnvGuard) {
        for key in [
            "CROUPIER_CONTROL_PORT",
            "CROUPIER_FUNCTION_PORT",
            "CROUPIER_POLICY_FILE",
            "CROUPIER_AUDIT_LOG",
            "CROUPIER_BALANCER",
            "CROUPIER_EDGE_ADDR",
            "CROUPIER_TLS_CERT",
            "CROUPIER_TLS_KEY",
            "CROUPIER_CLIENT_CA",
            "CROUPIER_AGENT_CA",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CROUPIER_PACK_DIR", "/etc/croupier/pack");
        clear_optional(&mut guard);

        let config = Config::from_env().unwrap();

        assert_eq!(config.pack_dir, PathBuf::from("/etc/croupier/pack"));
        assert_eq!(config.control_addr.port(), 7101);
        assert_eq!(config.function_addr.port(), 7102);
        assert_eq!(config.balancer, "round_robin");
        assert_eq!(config.audit_path, PathBuf::from("croupier-audit.log"));
        assert!(config.policy_path.is_none());
        assert!(config.edge_addr.is_none());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CROUPIER_PACK_DIR", "/opt/pack");
        clear_optional(&mut guard);
        guard.set("CROUPIER_CONTROL_PORT", "9101");
        guard.set("CROUPIER_FUNCTION_PORT", "9102");
        guard.set("CROUPIER_BALANCER", "consistent_hash");
        guard.set("CROUPIER_EDGE_ADDR", "10.0.0.9:7201");
        guard.set("CROUPIER_POLICY_FILE", "/opt/policy.json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.control_addr.port(), 9101);
        assert_eq!(config.function_addr.port(), 9102);
        assert_eq!(config.balancer, "consistent_hash");
        assert_eq!(config.edge_addr, Some("10.0.0.9:7201".parse().unwrap()));
        assert_eq!(config.policy_path, Some(PathBuf::from("/opt/policy.json")));
    }

    #[test]
    fn test_config_missing_pack_dir() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.remove("CROUPIER_PACK_DIR");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("CROUPIER_PACK_DIR")));
        assert!(err.to_string().contains("CROUPIER_PACK_DIR"));
    }

    #[test]
    fn test_config_invalid_port() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CROUPIER_PACK_DIR", "/opt/pack");
        clear_optional(&mut guard);
        guard.set("CROUPIER_CONTROL_PORT", "not_a_number");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("CROUPIER_CONTROL_PORT", _)
        ));
    }

    #[test]
    fn test_config_invalid_balancer() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CROUPIER_PACK_DIR", "/opt/pack");
        clear_optional(&mut guard);
        guard.set("CROUPIER_BALANCER", "fastest");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CROUPIER_BALANCER", _)));
    }

    #[test]
    fn test_config_invalid_edge_addr() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();

        guard.set("CROUPIER_PACK_DIR", "/opt/pack");
        clear_optional(&mut guard);
        guard.set("CROUPIER_EDGE_ADDR", "not-an-addr");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("CROUPIER_EDGE_ADDR", _)));
    }
}
