// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent registry with scoped function indexes.
//!
//! Registrations are leased; an agent that stops heartbeating drops out of
//! every lookup once its lease expires, without an explicit deregister.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};

/// Registration lease. Heartbeats extend it; silence lets it lapse.
pub fn lease() -> Duration {
    Duration::hours(24)
}

/// Metadata about one registered function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionMeta {
    /// Entity this function operates on ("table", "player", ...).
    pub entity: String,
    /// Operation kind ("create", "close", ...).
    pub operation: String,
    pub enabled: bool,
}

/// One live agent registration.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub version: String,
    /// Dialable function-plane address.
    pub rpc_addr: String,
    pub game_id: String,
    pub env: String,
    pub region: String,
    pub zone: String,
    pub labels: HashMap<String, String>,
    pub functions: HashMap<String, FunctionMeta>,
    pub session_id: String,
    pub expire_at: DateTime<Utc>,
}

impl AgentSession {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now < self.expire_at
    }

    /// Routing weight, taken from the `weight` label. Defaults to 1.
    pub fn weight(&self) -> u32 {
        self.labels
            .get("weight")
            .and_then(|w| w.parse().ok())
            .filter(|w| *w > 0)
            .unwrap_or(1)
    }
}

#[derive(Default)]
struct Indexes {
    agents: HashMap<String, AgentSession>,
    /// `game_id|function_id` -> agent ids, plus bare `function_id` as a
    /// legacy fallback for unscoped callers.
    by_function: HashMap<String, HashSet<String>>,
    /// entity -> function ids
    by_entity: HashMap<String, HashSet<String>>,
    /// operation -> function ids
    by_operation: HashMap<String, HashSet<String>>,
}

fn composite_key(game_id: &str, fid: &str) -> String {
    format!("{}|{}", game_id, fid)
}

/// Shared agent registry.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Indexes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an agent session atomically. Stale index entries
    /// from a previous registration of the same agent are removed first, so
    /// lookups never observe a half-updated agent.
    pub fn upsert(&self, session: AgentSession) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if let Some(old) = inner.agents.remove(&session.agent_id) {
            let functions: Vec<(String, FunctionMeta)> = old.functions.into_iter().collect();
            for (fid, meta) in functions {
                let key = composite_key(&old.game_id, &fid);
                if let Some(set) = inner.by_function.get_mut(&key) {
                    set.remove(&old.agent_id);
                }
                if let Some(set) = inner.by_function.get_mut(&fid) {
                    set.remove(&old.agent_id);
                }
                // the entity/operation indexes are shared across agents; a
                // function id leaves them only once no registration exposes it
                let still_exposed = inner
                    .agents
                    .values()
                    .any(|agent| agent.functions.contains_key(&fid));
                if still_exposed {
                    continue;
                }
                if !meta.entity.is_empty()
                    && let Some(set) = inner.by_entity.get_mut(&meta.entity)
                {
                    set.remove(&fid);
                }
                if !meta.operation.is_empty()
                    && let Some(set) = inner.by_operation.get_mut(&meta.operation)
                {
                    set.remove(&fid);
                }
            }
        }

        for (fid, meta) in &session.functions {
            let key = composite_key(&session.game_id, fid);
            inner
                .by_function
                .entry(key)
                .or_default()
                .insert(session.agent_id.clone());
            inner
                .by_function
                .entry(fid.clone())
                .or_default()
                .insert(session.agent_id.clone());

            if !meta.entity.is_empty() {
                inner
                    .by_entity
                    .entry(meta.entity.clone())
                    .or_default()
                    .insert(fid.clone());
            }
            if !meta.operation.is_empty() {
                inner
                    .by_operation
                    .entry(meta.operation.clone())
                    .or_default()
                    .insert(fid.clone());
            }
        }

        inner.agents.insert(session.agent_id.clone(), session);
    }

    /// Extend an agent's lease. Unknown agents are ignored; a restarting
    /// server simply waits for the next register.
    pub fn heartbeat(&self, agent_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(agent) = inner.agents.get_mut(agent_id) {
            agent.expire_at = Utc::now() + lease();
        }
    }

    /// Update mutable metadata without touching function indexes.
    pub fn update_meta(
        &self,
        agent_id: &str,
        region: Option<String>,
        zone: Option<String>,
        labels: Option<HashMap<String, String>>,
    ) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match inner.agents.get_mut(agent_id) {
            Some(agent) => {
                if let Some(region) = region {
                    agent.region = region;
                }
                if let Some(zone) = zone {
                    agent.zone = zone;
                }
                if let Some(labels) = labels {
                    agent.labels = labels;
                }
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, agent_id: &str) {
        let session = {
            let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
            inner.agents.get(agent_id).cloned()
        };
        if let Some(mut session) = session {
            // expire it, then reuse upsert's cleanup by re-upserting with no
            // functions and removing the record
            session.functions.clear();
            self.upsert(session);
            let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
            inner.agents.remove(agent_id);
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentSession> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        inner.agents.get(agent_id).cloned()
    }

    /// Live agents serving `(game_id, function_id)`. With `fallback`, an
    /// empty scoped result falls back to the unscoped legacy index.
    pub fn agents_for_function_scoped(
        &self,
        game_id: &str,
        fid: &str,
        fallback: bool,
    ) -> Vec<AgentSession> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();

        let collect = |ids: &HashSet<String>| -> Vec<AgentSession> {
            let mut out: Vec<AgentSession> = ids
                .iter()
                .filter_map(|id| inner.agents.get(id))
                .filter(|a| a.is_live(now))
                .cloned()
                .collect();
            // deterministic order for balancers
            out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
            out
        };

        if let Some(ids) = inner.by_function.get(&composite_key(game_id, fid)) {
            let out = collect(ids);
            if !out.is_empty() || !fallback {
                return out;
            }
        }
        if fallback
            && let Some(ids) = inner.by_function.get(fid)
        {
            return collect(ids);
        }
        Vec::new()
    }

    /// Function ids operating on the given entity.
    pub fn functions_for_entity(&self, entity: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<String> = inner
            .by_entity
            .get(entity)
            .map(|fids| fids.iter().cloned().collect())
            .unwrap_or_default();
        out.sort();
        out
    }

    /// Entities that support the given operation.
    pub fn entities_with_operation(&self, operation: &str) -> Vec<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let Some(fids) = inner.by_operation.get(operation) else {
            return Vec::new();
        };
        let mut entities: HashSet<String> = HashSet::new();
        for agent in inner.agents.values() {
            for (fid, meta) in &agent.functions {
                if fids.contains(fid) && !meta.entity.is_empty() {
                    entities.insert(meta.entity.clone());
                }
            }
        }
        let mut out: Vec<String> = entities.into_iter().collect();
        out.sort();
        out
    }

    /// First enabled function id matching `(entity, operation)`.
    pub fn function_by_entity_op(&self, entity: &str, operation: &str) -> Option<String> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut candidates: Vec<&String> = Vec::new();
        for agent in inner.agents.values() {
            for (fid, meta) in &agent.functions {
                if meta.entity == entity && meta.operation == operation && meta.enabled {
                    candidates.push(fid);
                }
            }
        }
        candidates.sort();
        candidates.first().map(|s| s.to_string())
    }

    /// All live agents, for introspection.
    pub fn live_agents(&self) -> Vec<AgentSession> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut out: Vec<AgentSession> = inner
            .agents
            .values()
            .filter(|a| a.is_live(now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        out
    }
}

#[cfg(test)]
pub(crate) fn test_session(agent_id: &str, game_id: &str, fids: &[&str]) -> AgentSession {
    AgentSession {
        agent_id: agent_id.to_string(),
        version: "0.0.0".to_string(),
        rpc_addr: format!("127.0.0.1:1{}", agent_id.len()),
        game_id: game_id.to_string(),
        env: "dev".to_string(),
        region: String::new(),
        zone: String::new(),
        labels: HashMap::new(),
        functions: fids
            .iter()
            .map(|fid| {
                let (entity, operation) = fid.split_once('.').unwrap_or((fid, ""));
                (
                    fid.to_string(),
                    FunctionMeta {
                        entity: entity.to_string(),
                        operation: operation.to_string(),
                        enabled: true,
                    },
                )
            })
            .collect(),
        session_id: format!("sess-{}", agent_id),
        expire_at: Utc::now() + lease(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_and_scoped_lookup() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));
        registry.upsert(test_session("agent-2", "poker", &["table.close"]));
        registry.upsert(test_session("agent-3", "chess", &["table.close"]));

        let agents = registry.agents_for_function_scoped("poker", "table.close", false);
        assert_eq!(agents.len(), 2);
        assert_eq!(agents[0].agent_id, "agent-1");
        assert_eq!(agents[1].agent_id, "agent-2");
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));

        let agents = registry.agents_for_function_scoped("poker", "table.close", false);
        assert_eq!(agents.len(), 1);
    }

    #[test]
    fn test_reregistration_drops_stale_functions() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close", "player.kick"]));
        // agent restarts exposing a different set
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));

        assert!(
            registry
                .agents_for_function_scoped("poker", "player.kick", false)
                .is_empty()
        );
        assert_eq!(
            registry
                .agents_for_function_scoped("poker", "table.close", false)
                .len(),
            1
        );
    }

    #[test]
    fn test_reregistration_spares_functions_other_agents_expose() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-a", "poker", &["table.close"]));
        registry.upsert(test_session("agent-b", "poker", &["table.close"]));

        // agent-a restarts exposing something else; agent-b still serves
        // table.close, so the entity/operation indexes must keep it
        registry.upsert(test_session("agent-a", "poker", &["player.kick"]));

        assert_eq!(
            registry.functions_for_entity("table"),
            vec!["table.close".to_string()]
        );
        assert_eq!(
            registry.entities_with_operation("close"),
            vec!["table".to_string()]
        );
        assert_eq!(
            registry.function_by_entity_op("table", "close"),
            Some("table.close".to_string())
        );
        let agents = registry.agents_for_function_scoped("poker", "table.close", false);
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].agent_id, "agent-b");
    }

    #[test]
    fn test_reregistration_under_new_game_drops_old_scope() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));
        registry.upsert(test_session("agent-1", "chess", &["table.close"]));

        assert!(
            registry
                .agents_for_function_scoped("poker", "table.close", false)
                .is_empty()
        );
        assert_eq!(
            registry
                .agents_for_function_scoped("chess", "table.close", false)
                .len(),
            1
        );
    }

    #[test]
    fn test_legacy_fallback() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));

        // wrong game with fallback finds the agent through the legacy index
        let agents = registry.agents_for_function_scoped("chess", "table.close", true);
        assert_eq!(agents.len(), 1);

        // without fallback it stays empty
        assert!(
            registry
                .agents_for_function_scoped("chess", "table.close", false)
                .is_empty()
        );
    }

    #[test]
    fn test_expired_agents_are_skipped() {
        let registry = Registry::new();
        let mut session = test_session("agent-1", "poker", &["table.close"]);
        session.expire_at = Utc::now() - Duration::seconds(1);
        registry.upsert(session);

        assert!(
            registry
                .agents_for_function_scoped("poker", "table.close", true)
                .is_empty()
        );
        assert!(registry.live_agents().is_empty());
    }

    #[test]
    fn test_heartbeat_extends_lease() {
        let registry = Registry::new();
        let mut session = test_session("agent-1", "poker", &["table.close"]);
        session.expire_at = Utc::now() + Duration::seconds(1);
        registry.upsert(session);

        registry.heartbeat("agent-1");
        let agent = registry.get("agent-1").unwrap();
        assert!(agent.expire_at > Utc::now() + Duration::hours(23));
    }

    #[test]
    fn test_heartbeat_unknown_agent_is_noop() {
        let registry = Registry::new();
        registry.heartbeat("ghost");
        assert!(registry.get("ghost").is_none());
    }

    #[test]
    fn test_update_meta() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));

        assert!(registry.update_meta(
            "agent-1",
            Some("eu-west".to_string()),
            None,
            Some(HashMap::from([("weight".to_string(), "3".to_string())])),
        ));
        let agent = registry.get("agent-1").unwrap();
        assert_eq!(agent.region, "eu-west");
        assert_eq!(agent.weight(), 3);

        assert!(!registry.update_meta("ghost", None, None, None));
    }

    #[test]
    fn test_remove() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close"]));
        registry.remove("agent-1");

        assert!(registry.get("agent-1").is_none());
        assert!(
            registry
                .agents_for_function_scoped("poker", "table.close", true)
                .is_empty()
        );
    }

    #[test]
    fn test_entity_operation_indexes() {
        let registry = Registry::new();
        registry.upsert(test_session("agent-1", "poker", &["table.close", "table.open"]));
        registry.upsert(test_session("agent-2", "poker", &["player.kick"]));

        assert_eq!(
            registry.functions_for_entity("table"),
            vec!["table.close".to_string(), "table.open".to_string()]
        );
        assert_eq!(
            registry.entities_with_operation("kick"),
            vec!["player".to_string()]
        );
        assert_eq!(
            registry.function_by_entity_op("table", "close"),
            Some("table.close".to_string())
        );
        assert_eq!(registry.function_by_entity_op("table", "kick"), None);
    }

    #[test]
    fn test_weight_defaults_to_one() {
        let session = test_session("agent-1", "poker", &["table.close"]);
        assert_eq!(session.weight(), 1);

        let mut weighted = test_session("agent-2", "poker", &["table.close"]);
        weighted
            .labels
            .insert("weight".to_string(), "0".to_string());
        // zero weight is meaningless, treated as 1
        assert_eq!(weighted.weight(), 1);
    }
}
