// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Rule-based token bucket rate limiting, consulted before dialing.
//!
//! Rules are replaced atomically as a set. For each call the best-matching
//! service rule (by agent) and function rule (by function id) are applied;
//! a denial surfaces `RATE_LIMITED` and never touches agent health.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::registry::AgentSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleScope {
    /// Keyed by function id.
    Function,
    /// Keyed by agent id.
    Service,
}

/// Optional selectors narrowing which agents a rule covers. Every populated
/// field must match; each match raises the rule's score.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleMatch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub game_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateRule {
    pub scope: RuleScope,
    /// Agent id (service scope) or function id (function scope); `*` matches
    /// everything in scope.
    pub key: String,
    pub limit_qps: u32,
    #[serde(default)]
    pub r#match: RuleMatch,
    /// Scaling percentage, clamped to 1..=100 on load.
    #[serde(default = "default_percent")]
    pub percent: u32,
}

fn default_percent() -> u32 {
    100
}

impl RateRule {
    /// Post-scaling limit. Any positive limit floors at 1 qps.
    fn effective_qps(&self) -> u32 {
        if self.limit_qps == 0 {
            return 0;
        }
        (self.limit_qps * self.percent / 100).max(1)
    }

    /// Match score against an agent, `None` when the rule does not apply.
    fn score(&self, agent: &AgentSession) -> Option<u32> {
        let mut score = 0;
        let m = &self.r#match;
        for (want, have) in [
            (&m.game_id, &agent.game_id),
            (&m.env, &agent.env),
            (&m.region, &agent.region),
            (&m.zone, &agent.zone),
        ] {
            if !want.is_empty() {
                if want != have {
                    return None;
                }
                score += 1;
            }
        }
        for (k, want) in &m.labels {
            if agent.labels.get(k) != Some(want) {
                return None;
            }
            score += 1;
        }
        Some(score)
    }
}

struct TokenBucket {
    tokens: f64,
    rate: f64,
    capacity: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    fn new(qps: u32) -> Self {
        let qps = f64::from(qps);
        Self {
            tokens: qps,
            rate: qps,
            capacity: qps,
            refilled_at: Instant::now(),
        }
    }

    fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.refilled_at = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[derive(Default)]
struct LimiterState {
    rules: Vec<RateRule>,
    buckets: HashMap<String, TokenBucket>,
}

/// Shared rate limiter. One mutex guards both the rule set and the buckets
/// so a rule swap can atomically drop stale buckets.
#[derive(Default)]
pub struct RateLimiter {
    inner: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the rule set. Rules with an empty key or zero limit are
    /// dropped; `percent` is clamped to 1..=100. Buckets are reset so new
    /// limits take effect immediately.
    pub fn replace_rules(&self, rules: Vec<RateRule>) {
        let normalized: Vec<RateRule> = rules
            .into_iter()
            .filter(|r| !r.key.trim().is_empty() && r.limit_qps > 0)
            .map(|mut r| {
                r.key = r.key.trim().to_string();
                r.percent = r.percent.clamp(1, 100);
                r
            })
            .collect();

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.rules = normalized;
        inner.buckets.clear();
    }

    /// Consult the best-matching rules for this call. `Ok` admits it;
    /// `RateLimited` denies it without consuming anything else.
    pub fn check(&self, agent: &AgentSession, function_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        if let Some((qps, key)) = best_rule(&inner.rules, RuleScope::Service, &agent.agent_id, agent)
        {
            let bucket = inner
                .buckets
                .entry(format!("svc|{}", key))
                .or_insert_with(|| TokenBucket::new(qps));
            if !bucket.try_acquire(now) {
                return Err(CoreError::RateLimited(agent.agent_id.clone()));
            }
        }

        if let Some((qps, key)) = best_rule(&inner.rules, RuleScope::Function, function_id, agent) {
            let bucket = inner
                .buckets
                .entry(format!("fn|{}", key))
                .or_insert_with(|| TokenBucket::new(qps));
            if !bucket.try_acquire(now) {
                return Err(CoreError::RateLimited(function_id.to_string()));
            }
        }

        Ok(())
    }

    /// Effective per-second limit the service rules impose on this agent,
    /// `None` when unlimited.
    pub fn effective_qps(&self, agent: &AgentSession) -> Option<u32> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        best_rule(&inner.rules, RuleScope::Service, &agent.agent_id, agent).map(|(qps, _)| qps)
    }
}

/// Highest-scoring applicable rule; declaration order breaks ties. Returns
/// the effective qps and the bucket key (the rule key, so a wildcard rule
/// shares one bucket).
fn best_rule(
    rules: &[RateRule],
    scope: RuleScope,
    key: &str,
    agent: &AgentSession,
) -> Option<(u32, String)> {
    let mut best: Option<(u32, &RateRule)> = None;
    for rule in rules {
        if rule.scope != scope || (rule.key != "*" && rule.key != key) {
            continue;
        }
        let Some(score) = rule.score(agent) else {
            continue;
        };
        // strict > keeps the earliest rule on equal scores
        if best.is_none_or(|(s, _)| score > s) {
            best = Some((score, rule));
        }
    }
    best.map(|(_, rule)| (rule.effective_qps(), rule.key.clone()))
        .filter(|(qps, _)| *qps > 0)
}
