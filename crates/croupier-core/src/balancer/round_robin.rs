// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use super::{LoadBalancer, healthy_or_err};
use crate::error::Result;
use crate::registry::AgentSession;
use crate::stats::HealthChecker;

/// Plain round robin over the healthy candidates.
pub struct RoundRobinBalancer {
    counter: AtomicU64,
    health: Arc<HealthChecker>,
}

impl RoundRobinBalancer {
    pub fn new(health: Arc<HealthChecker>) -> Self {
        Self {
            counter: AtomicU64::new(0),
            health,
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn pick(&self, candidates: &[AgentSession], _key: &str) -> Result<AgentSession> {
        let healthy = healthy_or_err(&self.health, candidates)?;
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
        Ok(healthy[index].clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::agent;
    use super::*;

    #[test]
    fn test_cycles_through_candidates() {
        let lb = RoundRobinBalancer::new(Arc::new(HealthChecker::new()));
        let candidates = vec![agent("a-1"), agent("a-2"), agent("a-3")];

        let picks: Vec<String> = (0..6)
            .map(|_| lb.pick(&candidates, "").unwrap().agent_id)
            .collect();

        // every candidate appears twice over two full cycles
        for a in ["a-1", "a-2", "a-3"] {
            assert_eq!(picks.iter().filter(|p| *p == a).count(), 2, "{}", a);
        }
    }

    #[test]
    fn test_skips_unhealthy() {
        let health = Arc::new(HealthChecker::new());
        health.set_healthy("a-2", false);
        let lb = RoundRobinBalancer::new(health);
        let candidates = vec![agent("a-1"), agent("a-2"), agent("a-3")];

        for _ in 0..10 {
            let picked = lb.pick(&candidates, "").unwrap();
            assert_ne!(picked.agent_id, "a-2");
        }
    }
}
