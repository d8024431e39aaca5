// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-(game, env) function assignments.
//!
//! An assignment is an ordered allowlist of function ids. Agents poll it and
//! only expose assigned functions; the function plane enforces it again at
//! invocation time. An empty list means no restriction.

use std::collections::HashMap;
use std::sync::RwLock;

fn scope_key(game_id: &str, env: &str) -> String {
    format!("{}|{}", game_id, env)
}

/// Outcome of an assignment update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Ids accepted into the assignment, deduplicated, declaration order.
    pub assigned: Vec<String>,
    /// Ids rejected because the loaded pack does not know them.
    pub unknown: Vec<String>,
}

#[derive(Default)]
pub struct AssignmentStore {
    by_scope: RwLock<HashMap<String, Vec<String>>>,
}

impl AssignmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the assignment for `(game_id, env)` atomically. Ids are
    /// trimmed and deduplicated preserving first occurrence; ids failing
    /// `known` are reported back instead of stored.
    pub fn update<F>(&self, game_id: &str, env: &str, function_ids: &[String], known: F) -> UpdateOutcome
    where
        F: Fn(&str) -> bool,
    {
        let mut assigned = Vec::new();
        let mut unknown = Vec::new();
        for fid in function_ids {
            let id = fid.trim();
            if id.is_empty() || assigned.iter().any(|a| a == id) {
                continue;
            }
            if known(id) {
                assigned.push(id.to_string());
            } else {
                unknown.push(id.to_string());
            }
        }

        let mut by_scope = self.by_scope.write().unwrap_or_else(|e| e.into_inner());
        by_scope.insert(scope_key(game_id, env), assigned.clone());
        UpdateOutcome { assigned, unknown }
    }

    /// Assigned function ids for a scope. Empty means no restriction.
    pub fn get(&self, game_id: &str, env: &str) -> Vec<String> {
        let by_scope = self.by_scope.read().unwrap_or_else(|e| e.into_inner());
        by_scope
            .get(&scope_key(game_id, env))
            .cloned()
            .unwrap_or_default()
    }

    /// Whether a function may run in this scope. A missing or empty
    /// assignment allows everything.
    pub fn allows(&self, game_id: &str, env: &str, fid: &str) -> bool {
        let by_scope = self.by_scope.read().unwrap_or_else(|e| e.into_inner());
        match by_scope.get(&scope_key(game_id, env)) {
            Some(ids) if !ids.is_empty() => ids.iter().any(|a| a == fid),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_missing_assignment_allows_all() {
        let store = AssignmentStore::new();
        assert!(store.allows("poker", "prod", "table.close"));
        assert!(store.get("poker", "prod").is_empty());
    }

    #[test]
    fn test_update_filters_unknown_ids() {
        let store = AssignmentStore::new();
        let outcome = store.update(
            "poker",
            "prod",
            &ids(&["table.close", "bogus.fn", "player.kick"]),
            |id| id != "bogus.fn",
        );
        assert_eq!(outcome.assigned, ids(&["table.close", "player.kick"]));
        assert_eq!(outcome.unknown, ids(&["bogus.fn"]));
        assert_eq!(store.get("poker", "prod"), ids(&["table.close", "player.kick"]));
    }

    #[test]
    fn test_update_dedupes_preserving_order() {
        let store = AssignmentStore::new();
        let outcome = store.update(
            "poker",
            "prod",
            &ids(&["b.f", "a.f", " b.f ", ""]),
            |_| true,
        );
        assert_eq!(outcome.assigned, ids(&["b.f", "a.f"]));
        assert!(outcome.unknown.is_empty());
    }

    #[test]
    fn test_non_empty_assignment_restricts() {
        let store = AssignmentStore::new();
        store.update("poker", "prod", &ids(&["table.close"]), |_| true);

        assert!(store.allows("poker", "prod", "table.close"));
        assert!(!store.allows("poker", "prod", "player.kick"));
        // other scopes are unaffected
        assert!(store.allows("poker", "staging", "player.kick"));
    }

    #[test]
    fn test_update_to_empty_clears_restriction() {
        let store = AssignmentStore::new();
        store.update("poker", "prod", &ids(&["table.close"]), |_| true);
        store.update("poker", "prod", &[], |_| true);
        assert!(store.allows("poker", "prod", "player.kick"));
    }
}
