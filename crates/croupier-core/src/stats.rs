// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-agent health and request statistics feeding the balancers.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};

const QPS_WINDOW_SECS: usize = 60;

/// A point-in-time snapshot of one agent's counters.
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub agent_id: String,
    pub active_conns: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub avg_response_time: Duration,
    pub last_seen: DateTime<Utc>,
    /// Requests per second averaged over the last minute.
    pub qps_1m: f64,
}

struct AgentCounters {
    active_conns: i64,
    total_requests: u64,
    failed_requests: u64,
    avg_response_time: Duration,
    last_seen: DateTime<Utc>,
    // one slot per second, indexed by epoch second mod window
    qps_slots: [u32; QPS_WINDOW_SECS],
    qps_stamps: [i64; QPS_WINDOW_SECS],
}

impl AgentCounters {
    fn new() -> Self {
        Self {
            active_conns: 0,
            total_requests: 0,
            failed_requests: 0,
            avg_response_time: Duration::ZERO,
            last_seen: Utc::now(),
            qps_slots: [0; QPS_WINDOW_SECS],
            qps_stamps: [0; QPS_WINDOW_SECS],
        }
    }

    fn bump_qps(&mut self, now: DateTime<Utc>) {
        let sec = now.timestamp();
        let idx = sec.rem_euclid(QPS_WINDOW_SECS as i64) as usize;
        if self.qps_stamps[idx] != sec {
            self.qps_stamps[idx] = sec;
            self.qps_slots[idx] = 0;
        }
        self.qps_slots[idx] += 1;
    }

    fn qps_1m(&self, now: DateTime<Utc>) -> f64 {
        let sec = now.timestamp();
        let mut total: u64 = 0;
        for i in 0..QPS_WINDOW_SECS {
            if sec - self.qps_stamps[i] < QPS_WINDOW_SECS as i64 {
                total += u64::from(self.qps_slots[i]);
            }
        }
        total as f64 / QPS_WINDOW_SECS as f64
    }

    fn snapshot(&self, agent_id: &str, now: DateTime<Utc>) -> AgentStats {
        AgentStats {
            agent_id: agent_id.to_string(),
            active_conns: self.active_conns,
            total_requests: self.total_requests,
            failed_requests: self.failed_requests,
            avg_response_time: self.avg_response_time,
            last_seen: self.last_seen,
            qps_1m: self.qps_1m(now),
        }
    }
}

/// Request statistics keyed by agent id.
#[derive(Default)]
pub struct StatsCollector {
    inner: RwLock<HashMap<String, AgentCounters>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_request(&self, agent_id: &str, duration: Duration, success: bool) {
        let now = Utc::now();
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let counters = inner
            .entry(agent_id.to_string())
            .or_insert_with(AgentCounters::new);

        counters.total_requests += 1;
        if !success {
            counters.failed_requests += 1;
        }

        // cumulative moving average
        if counters.total_requests == 1 {
            counters.avg_response_time = duration;
        } else {
            let n = counters.total_requests as u128;
            let prev = counters.avg_response_time.as_nanos();
            let avg = (prev * (n - 1) + duration.as_nanos()) / n;
            counters.avg_response_time = Duration::from_nanos(avg as u64);
        }

        counters.last_seen = now;
        counters.bump_qps(now);
    }

    /// Snapshot for one agent, `None` until the first recorded event.
    pub fn get_stats(&self, agent_id: &str) -> Option<AgentStats> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(agent_id).map(|c| c.snapshot(agent_id, Utc::now()))
    }

    pub fn all_stats(&self) -> HashMap<String, AgentStats> {
        let now = Utc::now();
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner
            .iter()
            .map(|(id, c)| (id.clone(), c.snapshot(id, now)))
            .collect()
    }

    pub fn increment_active(&self, agent_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let counters = inner
            .entry(agent_id.to_string())
            .or_insert_with(AgentCounters::new);
        counters.active_conns += 1;
    }

    pub fn decrement_active(&self, agent_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(counters) = inner.get_mut(agent_id)
            && counters.active_conns > 0
        {
            counters.active_conns -= 1;
        }
    }
}

/// Health flags keyed by agent id. Untracked agents count as healthy so a
/// freshly registered agent is immediately routable.
#[derive(Default)]
pub struct HealthChecker {
    inner: RwLock<HashMap<String, bool>>,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn is_healthy(&self, agent_id: &str) -> bool {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.get(agent_id).copied().unwrap_or(true)
    }

    pub fn set_healthy(&self, agent_id: &str, healthy: bool) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.insert(agent_id.to_string(), healthy);
    }

    /// 0 or 100; untracked agents score 100.
    pub fn health_score(&self, agent_id: &str) -> u8 {
        if self.is_healthy(agent_id) { 100 } else { 0 }
    }

    pub fn forget(&self, agent_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        inner.remove(agent_id);
    }
}
