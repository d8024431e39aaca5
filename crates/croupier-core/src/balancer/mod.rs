// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Load balancing strategies over registry candidates.
//!
//! Every strategy filters through the shared [`HealthChecker`] first; the hash
//! key only matters to [`ConsistentHashBalancer`] and is ignored elsewhere.

mod consistent_hash;
mod least_conn;
mod round_robin;
mod weighted;

use std::sync::Arc;

pub use consistent_hash::ConsistentHashBalancer;
pub use least_conn::LeastConnectionsBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::WeightedRoundRobinBalancer;

use crate::error::{CoreError, Result};
use crate::registry::AgentSession;
use crate::stats::{HealthChecker, StatsCollector};

pub trait LoadBalancer: Send + Sync {
    /// Select one agent out of `candidates`. `key` is the hash key for
    /// affinity-aware strategies.
    fn pick(&self, candidates: &[AgentSession], key: &str) -> Result<AgentSession>;

    fn name(&self) -> &'static str;
}

/// Build the strategy selected by `CROUPIER_BALANCER`.
pub fn from_name(
    name: &str,
    health: Arc<HealthChecker>,
    stats: Arc<StatsCollector>,
) -> Result<Arc<dyn LoadBalancer>> {
    match name {
        "round_robin" => Ok(Arc::new(RoundRobinBalancer::new(health))),
        "weighted" => Ok(Arc::new(WeightedRoundRobinBalancer::new(health))),
        "least_conn" => Ok(Arc::new(LeastConnectionsBalancer::new(stats, health))),
        "consistent_hash" => Ok(Arc::new(ConsistentHashBalancer::new(150, health))),
        other => Err(CoreError::BadRequest(format!(
            "unknown balancer strategy '{}'",
            other
        ))),
    }
}

fn filter_healthy(health: &HealthChecker, candidates: &[AgentSession]) -> Vec<AgentSession> {
    candidates
        .iter()
        .filter(|a| health.is_healthy(&a.agent_id))
        .cloned()
        .collect()
}

fn healthy_or_err(
    health: &HealthChecker,
    candidates: &[AgentSession],
) -> Result<Vec<AgentSession>> {
    if candidates.is_empty() {
        return Err(CoreError::NoAgentAvailable(
            "no candidates available".to_string(),
        ));
    }
    let healthy = filter_healthy(health, candidates);
    if healthy.is_empty() {
        return Err(CoreError::NoAgentAvailable(
            "no healthy candidates available".to_string(),
        ));
    }
    Ok(healthy)
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::registry::AgentSession;
    use chrono::Utc;
    use std::collections::HashMap;

    pub fn agent(id: &str) -> AgentSession {
        AgentSession {
            agent_id: id.to_string(),
            version: "1.0.0".to_string(),
            rpc_addr: "10.0.0.1:7201".to_string(),
            game_id: "poker".to_string(),
            env: "prod".to_string(),
            region: String::new(),
            zone: String::new(),
            labels: HashMap::new(),
            functions: HashMap::new(),
            session_id: format!("s-{}", id),
            expire_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    pub fn weighted_agent(id: &str, weight: u32) -> AgentSession {
        let mut a = agent(id);
        a.labels.insert("weight".to_string(), weight.to_string());
        a
    }
}
