// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{LoadBalancer, healthy_or_err};
use crate::error::Result;
use crate::registry::AgentSession;
use crate::stats::HealthChecker;

/// Smooth weighted round robin.
///
/// Weights come from each session's `weight` label. Every pick raises each
/// candidate's running counter by its weight and selects the highest, then
/// lowers the winner by the combined weight. Counters are shifted down by
/// their minimum afterwards so they never grow unbounded.
pub struct WeightedRoundRobinBalancer {
    counters: Mutex<HashMap<String, i64>>,
    health: Arc<HealthChecker>,
}

impl WeightedRoundRobinBalancer {
    pub fn new(health: Arc<HealthChecker>) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            health,
        }
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn pick(&self, candidates: &[AgentSession], _key: &str) -> Result<AgentSession> {
        let healthy = healthy_or_err(&self.health, candidates)?;

        let mut counters = self.counters.lock().unwrap_or_else(|e| e.into_inner());

        let mut total_weight = 0i64;
        let mut selected = 0usize;
        let mut max_current = i64::MIN;
        for (i, agent) in healthy.iter().enumerate() {
            let weight = i64::from(agent.weight());
            total_weight += weight;
            let current = counters.get(&agent.agent_id).copied().unwrap_or(0) + weight;
            counters.insert(agent.agent_id.clone(), current);
            if current > max_current {
                max_current = current;
                selected = i;
            }
        }

        let picked = healthy[selected].clone();
        *counters.entry(picked.agent_id.clone()).or_insert(0) -= total_weight;

        // keep counters near zero
        if let Some(min) = counters.values().copied().min() {
            for counter in counters.values_mut() {
                *counter -= min;
            }
        }

        Ok(picked)
    }

    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }
}
