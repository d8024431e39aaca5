// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Allowed-games gate for agent registration.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

/// One allowlist entry. An empty `env` allows the game in every environment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GameEntry {
    pub game_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub env: String,
}

/// Registration allowlist keyed `game_id -> envs`.
///
/// An empty store admits everything; operators opt into gating by adding the
/// first entry.
#[derive(Default)]
pub struct GameStore {
    set: RwLock<HashMap<String, HashSet<String>>>,
}

impl GameStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, game_id: impl Into<String>, env: impl Into<String>) {
        let mut set = self.set.write().unwrap_or_else(|e| e.into_inner());
        let envs = set.entry(game_id.into()).or_default();
        let env = env.into();
        if !env.is_empty() {
            envs.insert(env);
        }
    }

    pub fn is_allowed(&self, game_id: &str, env: &str) -> bool {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        if set.is_empty() {
            return true;
        }
        let Some(envs) = set.get(game_id) else {
            return false;
        };
        // registered with no envs means any env
        envs.is_empty() || env.is_empty() || envs.contains(env)
    }

    pub fn list(&self) -> Vec<GameEntry> {
        let set = self.set.read().unwrap_or_else(|e| e.into_inner());
        let mut out = Vec::new();
        for (game_id, envs) in set.iter() {
            if envs.is_empty() {
                out.push(GameEntry {
                    game_id: game_id.clone(),
                    env: String::new(),
                });
            } else {
                for env in envs {
                    out.push(GameEntry {
                        game_id: game_id.clone(),
                        env: env.clone(),
                    });
                }
            }
        }
        out.sort_by(|a, b| (&a.game_id, &a.env).cmp(&(&b.game_id, &b.env)));
        out
    }
}
