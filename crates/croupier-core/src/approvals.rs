// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pending-action store for the two-person rule.
//!
//! When policy answers `REQUIRES_APPROVAL`, the rejected call is parked here.
//! Approvers sign off out of band; a later retry of the same call (same
//! function and idempotency key) picks up the recorded grants.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
}

/// A parked call awaiting sign-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Approval {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub actor: String,
    pub function_id: String,
    pub idempotency_key: String,
    pub game_id: String,
    pub env: String,
    pub state: ApprovalState,
    /// Rejection reason, empty otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Recorded sign-offs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<ApprovalGrant>,
}

/// One approver's sign-off.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGrant {
    pub approver_id: String,
    pub role: String,
    pub timestamp: DateTime<Utc>,
}

/// In-memory approvals store.
#[derive(Default)]
pub struct ApprovalStore {
    data: RwLock<HashMap<String, Approval>>,
}

impl ApprovalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, approval: Approval) -> Result<(), CoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        if data.contains_key(&approval.id) {
            return Err(CoreError::BadRequest(format!(
                "duplicate approval id '{}'",
                approval.id
            )));
        }
        data.insert(approval.id.clone(), approval);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Approval> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(id).cloned()
    }

    /// Record a sign-off. Flips the state to `Approved`; additional grants
    /// on an already approved entry just accumulate.
    pub fn approve(
        &self,
        id: &str,
        approver_id: &str,
        role: &str,
    ) -> Result<Approval, CoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let approval = data
            .get_mut(id)
            .ok_or_else(|| CoreError::BadRequest(format!("approval '{}' not found", id)))?;
        if approval.state == ApprovalState::Rejected {
            return Err(CoreError::BadRequest(format!(
                "approval '{}' already rejected",
                id
            )));
        }
        approval.grants.push(ApprovalGrant {
            approver_id: approver_id.to_string(),
            role: role.to_string(),
            timestamp: Utc::now(),
        });
        approval.state = ApprovalState::Approved;
        Ok(approval.clone())
    }

    pub fn reject(&self, id: &str, reason: &str) -> Result<Approval, CoreError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        let approval = data
            .get_mut(id)
            .ok_or_else(|| CoreError::BadRequest(format!("approval '{}' not found", id)))?;
        if approval.state != ApprovalState::Pending {
            return Err(CoreError::BadRequest(format!(
                "approval '{}' is not pending",
                id
            )));
        }
        approval.state = ApprovalState::Rejected;
        approval.reason = reason.to_string();
        Ok(approval.clone())
    }

    /// Grants recorded for a retried call, matched by function id and
    /// idempotency key.
    pub fn grants_for(&self, function_id: &str, idempotency_key: &str) -> Vec<ApprovalGrant> {
        if idempotency_key.is_empty() {
            return Vec::new();
        }
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.values()
            .filter(|a| {
                a.state == ApprovalState::Approved
                    && a.function_id == function_id
                    && a.idempotency_key == idempotency_key
            })
            .flat_map(|a| a.grants.iter().cloned())
            .collect()
    }

    /// Pending entries, newest first.
    pub fn list_pending(&self) -> Vec<Approval> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<Approval> = data
            .values()
            .filter(|a| a.state == ApprovalState::Pending)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }
}
