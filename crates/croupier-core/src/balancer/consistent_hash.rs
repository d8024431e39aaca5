// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::sync::Arc;

use super::{LoadBalancer, healthy_or_err};
use crate::error::Result;
use crate::registry::AgentSession;
use crate::stats::HealthChecker;

const DEFAULT_REPLICAS: usize = 150;

/// Consistent hashing over a ring of virtual nodes.
///
/// Each healthy agent contributes `replicas` points at the ring hash of
/// "agent_id#i". The hash key maps to the first ring point at or past its own
/// hash, wrapping to the start. Calls without a key fall back to the first
/// healthy candidate.
pub struct ConsistentHashBalancer {
    replicas: usize,
    health: Arc<HealthChecker>,
}

impl ConsistentHashBalancer {
    pub fn new(replicas: usize, health: Arc<HealthChecker>) -> Self {
        Self {
            replicas: if replicas == 0 {
                DEFAULT_REPLICAS
            } else {
                replicas
            },
            health,
        }
    }

    fn build_ring(&self, agents: &[AgentSession]) -> Vec<(u32, usize)> {
        let mut ring = Vec::with_capacity(agents.len() * self.replicas);
        for (idx, agent) in agents.iter().enumerate() {
            for i in 0..self.replicas {
                let point = ring_hash(format!("{}#{}", agent.agent_id, i).as_bytes());
                ring.push((point, idx));
            }
        }
        ring.sort_unstable_by_key(|(point, _)| *point);
        ring
    }
}

fn fnv32a(data: &[u8]) -> u32 {
    let mut hash: u32 = 2166136261;
    for b in data {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(16777619);
    }
    hash
}

/// FNV-1a alone clusters the short, sequential inputs the ring sees; the
/// multiply-xor finalizer spreads points over the full 32-bit space. Ring
/// points and lookup keys must go through the same function.
fn ring_hash(data: &[u8]) -> u32 {
    let mut h = fnv32a(data);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^ (h >> 16)
}

impl LoadBalancer for ConsistentHashBalancer {
    fn pick(&self, candidates: &[AgentSession], key: &str) -> Result<AgentSession> {
        let healthy = healthy_or_err(&self.health, candidates)?;

        if key.is_empty() {
            return Ok(healthy[0].clone());
        }

        let ring = self.build_ring(&healthy);
        let hash = ring_hash(key.as_bytes());
        let pos = ring.partition_point(|(point, _)| *point < hash);
        let (_, idx) = ring[pos % ring.len()];
        Ok(healthy[idx].clone())
    }

    fn name(&self) -> &'static str {
        "consistent_hash"
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::agent;
    use super::*;

    #[test]
    fn test_same_key_same_agent() {
        let lb = ConsistentHashBalancer::new(0, Arc::new(HealthChecker::new()));
        let candidates = vec![agent("a-1"), agent("a-2"), agent("a-3")];

        let first = lb.pick(&candidates, "player-42").unwrap().agent_id;
        for _ in 0..5 {
            assert_eq!(lb.pick(&candidates, "player-42").unwrap().agent_id, first);
        }
    }

    #[test]
    fn test_keys_spread_across_agents() {
        let lb = ConsistentHashBalancer::new(0, Arc::new(HealthChecker::new()));
        let candidates = vec![agent("a-1"), agent("a-2"), agent("a-3")];

        let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        for i in 0..100 {
            let key = format!("player-{}", i);
            *counts.entry(lb.pick(&candidates, &key).unwrap().agent_id).or_default() += 1;
        }
        assert_eq!(counts.len(), 3, "all agents own part of the ring: {:?}", counts);
        // no agent should be starved or dominate outright
        for (agent_id, count) in &counts {
            assert!(*count >= 10, "{} got only {} of 100 keys: {:?}", agent_id, count, counts);
        }
    }

    #[test]
    fn test_empty_key_falls_back_to_first_healthy() {
        let health = Arc::new(HealthChecker::new());
        health.set_healthy("a-1", false);
        let lb = ConsistentHashBalancer::new(0, health);
        let candidates = vec![agent("a-1"), agent("a-2"), agent("a-3")];

        assert_eq!(lb.pick(&candidates, "").unwrap().agent_id, "a-2");
    }

    #[test]
    fn test_mapping_mostly_stable_when_agent_leaves() {
        let lb = ConsistentHashBalancer::new(0, Arc::new(HealthChecker::new()));
        let full = vec![agent("a-1"), agent("a-2"), agent("a-3")];
        let reduced = vec![agent("a-1"), agent("a-3")];

        let mut moved = 0;
        for i in 0..100 {
            let key = format!("player-{}", i);
            let before = lb.pick(&full, &key).unwrap().agent_id;
            let after = lb.pick(&reduced, &key).unwrap().agent_id;
            if before != "a-2" && before != after {
                moved += 1;
            }
        }
        // keys not owned by the departed agent should stay put
        assert_eq!(moved, 0);
    }

    #[test]
    fn test_fnv32a_reference_values() {
        // reference vectors for 32-bit FNV-1a
        assert_eq!(fnv32a(b""), 0x811c9dc5);
        assert_eq!(fnv32a(b"a"), 0xe40c292c);
        assert_eq!(fnv32a(b"foobar"), 0xbf9cf968);
    }
}
