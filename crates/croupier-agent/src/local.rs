// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local registry of SDK-registered function endpoints.
//!
//! Game services running next to the agent register each function they
//! implement on the loopback control plane and keep the registration alive
//! with heartbeats. Invocations fan out round-robin over the live endpoints
//! for a function; endpoints silent for 60 s are skipped.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use croupier_proto::local::RegisterLocalRequest;
use tokio::time::Instant;
use tracing::{debug, info};

/// Registrations older than this without a heartbeat are considered stale.
const STALE_AFTER: Duration = Duration::from_secs(60);

/// One SDK endpoint serving a function.
#[derive(Debug, Clone)]
pub struct LocalEndpoint {
    pub service_id: String,
    pub addr: String,
    pub version: String,
    last_seen: Instant,
}

impl LocalEndpoint {
    pub fn is_live(&self) -> bool {
        self.last_seen.elapsed() < STALE_AFTER
    }
}

struct Slot {
    endpoints: Vec<LocalEndpoint>,
    /// Round-robin cursor over the live subset.
    cursor: usize,
}

#[derive(Default)]
pub struct LocalRegistry {
    functions: RwLock<HashMap<String, Slot>>,
}

impl LocalRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or refresh) an endpoint for a function. The same
    /// `service_id` re-registering replaces its previous entry.
    pub fn register(&self, request: &RegisterLocalRequest) {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        let slot = functions
            .entry(request.function_id.clone())
            .or_insert_with(|| Slot {
                endpoints: Vec::new(),
                cursor: 0,
            });
        slot.endpoints
            .retain(|e| e.service_id != request.service_id);
        slot.endpoints.push(LocalEndpoint {
            service_id: request.service_id.clone(),
            addr: request.addr.clone(),
            version: request.version.clone(),
            last_seen: Instant::now(),
        });
        info!(
            function_id = %request.function_id,
            service_id = %request.service_id,
            addr = %request.addr,
            "local endpoint registered"
        );
    }

    /// Refresh every registration held by a service instance.
    pub fn heartbeat(&self, service_id: &str) -> bool {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        let mut seen = false;
        let now = Instant::now();
        for slot in functions.values_mut() {
            for endpoint in slot.endpoints.iter_mut() {
                if endpoint.service_id == service_id {
                    endpoint.last_seen = now;
                    seen = true;
                }
            }
        }
        seen
    }

    /// Service ids with a live endpoint for this function.
    pub fn list_local(&self, function_id: &str) -> Vec<String> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = functions
            .get(function_id)
            .map(|slot| {
                slot.endpoints
                    .iter()
                    .filter(|e| e.is_live())
                    .map(|e| e.service_id.clone())
                    .collect()
            })
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Next live endpoint for a function, round-robin. Stale entries are
    /// dropped on the way.
    pub fn pick(&self, function_id: &str) -> Option<LocalEndpoint> {
        let mut functions = self.functions.write().unwrap_or_else(|e| e.into_inner());
        let slot = functions.get_mut(function_id)?;
        let before = slot.endpoints.len();
        slot.endpoints.retain(|e| e.is_live());
        if slot.endpoints.len() != before {
            debug!(function_id = %function_id, "dropped stale local endpoints");
        }
        if slot.endpoints.is_empty() {
            return None;
        }
        let endpoint = slot.endpoints[slot.cursor % slot.endpoints.len()].clone();
        slot.cursor = slot.cursor.wrapping_add(1);
        Some(endpoint)
    }

    /// A specific live endpoint by service id, for targeted invocations.
    pub fn pick_service(&self, function_id: &str, service_id: &str) -> Option<LocalEndpoint> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        functions.get(function_id)?.endpoints
            .iter()
            .find(|e| e.service_id == service_id && e.is_live())
            .cloned()
    }

    /// Function ids with at least one live endpoint, sorted.
    pub fn function_ids(&self) -> Vec<String> {
        let functions = self.functions.read().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = functions
            .iter()
            .filter(|(_, slot)| slot.endpoints.iter().any(|e| e.is_live()))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }
}
