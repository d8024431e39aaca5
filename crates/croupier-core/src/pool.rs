// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pooled client connections to agent function planes.
//!
//! One pool serves every dial target. Connections are reused while open,
//! capped per target, and swept by a maintenance loop that drops closed and
//! idle entries.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use croupier_proto::{CroupierClient, CroupierClientConfig};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{CoreError, Result};

/// A connection the pool can hold.
#[async_trait]
pub trait PoolableConn: Send + Sync + 'static {
    async fn is_open(&self) -> bool;
    async fn close(&self);
}

/// Establishes new connections for the pool.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: PoolableConn;

    async fn dial(&self, target: &str) -> Result<Self::Conn>;
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connection cap per target.
    pub max_per_target: usize,
    /// Idle time beyond which a connection is swept.
    pub max_idle: Duration,
    /// Maintenance sweep interval.
    pub sweep_interval: Duration,
    /// Bound on establishing a new connection.
    pub dial_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_target: 10,
            max_idle: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            dial_timeout: Duration::from_secs(10),
        }
    }
}

struct Entry<C> {
    conn: Arc<C>,
    last_used: Instant,
    use_count: u64,
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    pub total_connections: usize,
    pub idle_connections: usize,
    pub per_target: HashMap<String, usize>,
}

pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    config: PoolConfig,
    targets: Mutex<HashMap<String, Vec<Entry<D::Conn>>>>,
    closed: AtomicBool,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(dialer: D, config: PoolConfig) -> Self {
        Self {
            dialer,
            config,
            targets: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// An open connection to `target`, reused when possible. Closed entries
    /// linger until the next sweep and count against the per-target cap.
    pub async fn get(&self, target: &str) -> Result<Arc<D::Conn>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(CoreError::PoolClosed);
        }

        let mut targets = self.targets.lock().await;
        let entries = targets.entry(target.to_string()).or_default();
        for entry in entries.iter_mut() {
            if entry.conn.is_open().await {
                entry.last_used = Instant::now();
                entry.use_count += 1;
                return Ok(entry.conn.clone());
            }
        }
        if entries.len() >= self.config.max_per_target {
            return Err(CoreError::TooManyConnections(target.to_string()));
        }
        drop(targets);

        let conn = tokio::time::timeout(self.config.dial_timeout, self.dialer.dial(target))
            .await
            .map_err(|_| CoreError::DialFailure {
                addr: target.to_string(),
                reason: "dial timed out".to_string(),
            })??;
        let conn = Arc::new(conn);

        if self.closed.load(Ordering::Acquire) {
            conn.close().await;
            return Err(CoreError::PoolClosed);
        }

        let mut targets = self.targets.lock().await;
        targets.entry(target.to_string()).or_default().push(Entry {
            conn: conn.clone(),
            last_used: Instant::now(),
            use_count: 1,
        });
        Ok(conn)
    }

    /// Drop and close every connection for `target`. A no-op for unknown
    /// targets.
    pub async fn remove(&self, target: &str) {
        let entries = {
            let mut targets = self.targets.lock().await;
            targets.remove(target)
        };
        for entry in entries.into_iter().flatten() {
            entry.conn.close().await;
        }
    }

    /// Close the pool and every pooled connection. Subsequent `get` calls
    /// fail with `PoolClosed`.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Entry<D::Conn>> = {
            let mut targets = self.targets.lock().await;
            targets.drain().flat_map(|(_, v)| v).collect()
        };
        for entry in drained {
            entry.conn.close().await;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let targets = self.targets.lock().await;
        let mut stats = PoolStats::default();
        let now = Instant::now();
        for (target, entries) in targets.iter() {
            stats.total_connections += entries.len();
            stats.per_target.insert(target.clone(), entries.len());
            for entry in entries {
                if now.duration_since(entry.last_used) > self.config.max_idle {
                    stats.idle_connections += 1;
                }
            }
        }
        stats
    }

    /// One maintenance pass: evict closed connections and anything idle past
    /// `max_idle`.
    pub async fn sweep(&self) {
        let mut evicted = Vec::new();
        {
            let mut targets = self.targets.lock().await;
            let now = Instant::now();
            for (target, entries) in targets.iter_mut() {
                let mut kept = Vec::with_capacity(entries.len());
                for entry in entries.drain(..) {
                    let stale = now.duration_since(entry.last_used) > self.config.max_idle;
                    if stale || !entry.conn.is_open().await {
                        debug!(target = %target, stale, "evicting pooled connection");
                        evicted.push(entry);
                    } else {
                        kept.push(entry);
                    }
                }
                *entries = kept;
            }
            targets.retain(|_, v| !v.is_empty());
        }
        for entry in evicted {
            entry.conn.close().await;
        }
    }

    /// Periodic sweep until the pool closes.
    pub async fn run_maintenance(&self) {
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            self.sweep().await;
        }
    }
}

#[async_trait]
impl PoolableConn for CroupierClient {
    async fn is_open(&self) -> bool {
        self.is_connected().await
    }

    async fn close(&self) {
        CroupierClient::close(self).await;
    }
}

/// Dials agent function planes over QUIC using one shared TLS identity.
pub struct QuicDialer {
    ca_pem: Vec<u8>,
    cert_pem: Vec<u8>,
    key_pem: Vec<u8>,
    skip_cert_verification: bool,
}

impl QuicDialer {
    pub fn new(ca_pem: Vec<u8>, cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Self {
            ca_pem,
            cert_pem,
            key_pem,
            skip_cert_verification: false,
        }
    }

    /// Dev mode only.
    pub fn insecure() -> Self {
        Self {
            ca_pem: Vec::new(),
            cert_pem: Vec::new(),
            key_pem: Vec::new(),
            skip_cert_verification: true,
        }
    }
}

#[async_trait]
impl Dialer for QuicDialer {
    type Conn = CroupierClient;

    async fn dial(&self, target: &str) -> Result<CroupierClient> {
        let server_addr: SocketAddr = target.parse().map_err(|_| CoreError::DialFailure {
            addr: target.to_string(),
            reason: "invalid socket address".to_string(),
        })?;
        let config = CroupierClientConfig {
            server_addr,
            dangerous_skip_cert_verification: self.skip_cert_verification,
            ca_pem: self.ca_pem.clone(),
            cert_pem: self.cert_pem.clone(),
            key_pem: self.key_pem.clone(),
            ..CroupierClientConfig::default()
        };
        let client = CroupierClient::new(config).map_err(|e| CoreError::DialFailure {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
        client.connect().await.map_err(|e| CoreError::DialFailure {
            addr: target.to_string(),
            reason: e.to_string(),
        })?;
        Ok(client)
    }
}
