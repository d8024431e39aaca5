// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use super::{LoadBalancer, healthy_or_err};
use crate::error::Result;
use crate::registry::AgentSession;
use crate::stats::{HealthChecker, StatsCollector};

/// Picks the healthy candidate with the fewest active connections.
///
/// An agent the collector has never seen is preferred outright, so new agents
/// absorb load immediately.
pub struct LeastConnectionsBalancer {
    stats: Arc<StatsCollector>,
    health: Arc<HealthChecker>,
}

impl LeastConnectionsBalancer {
    pub fn new(stats: Arc<StatsCollector>, health: Arc<HealthChecker>) -> Self {
        Self { stats, health }
    }
}

impl LoadBalancer for LeastConnectionsBalancer {
    fn pick(&self, candidates: &[AgentSession], _key: &str) -> Result<AgentSession> {
        let healthy = healthy_or_err(&self.health, candidates)?;

        let mut selected = 0usize;
        let mut min_conns = i64::MAX;
        for (i, agent) in healthy.iter().enumerate() {
            let Some(stats) = self.stats.get_stats(&agent.agent_id) else {
                return Ok(agent.clone());
            };
            if stats.active_conns < min_conns {
                min_conns = stats.active_conns;
                selected = i;
            }
        }

        Ok(healthy[selected].clone())
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::agent;
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_prefers_fewest_active_conns() {
        let stats = Arc::new(StatsCollector::new());
        for _ in 0..3 {
            stats.increment_active("a-busy");
        }
        stats.increment_active("a-quiet");
        let lb = LeastConnectionsBalancer::new(stats, Arc::new(HealthChecker::new()));

        let picked = lb
            .pick(&[agent("a-busy"), agent("a-quiet")], "")
            .unwrap();
        assert_eq!(picked.agent_id, "a-quiet");
    }

    #[test]
    fn test_prefers_untracked_agent() {
        let stats = Arc::new(StatsCollector::new());
        stats.record_request("a-old", Duration::from_millis(1), true);
        let lb = LeastConnectionsBalancer::new(stats, Arc::new(HealthChecker::new()));

        let picked = lb.pick(&[agent("a-old"), agent("a-new")], "").unwrap();
        assert_eq!(picked.agent_id, "a-new");
    }

    #[test]
    fn test_skips_unhealthy() {
        let stats = Arc::new(StatsCollector::new());
        let health = Arc::new(HealthChecker::new());
        health.set_healthy("a-1", false);
        let lb = LeastConnectionsBalancer::new(stats, health);

        let picked = lb.pick(&[agent("a-1"), agent("a-2")], "").unwrap();
        assert_eq!(picked.agent_id, "a-2");
    }
}
