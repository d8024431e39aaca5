// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped RBAC policy and the unified authorization engine.
//!
//! The engine runs the full pipeline for one invocation: permission gate,
//! `allow_if` expression, risk constraints, then the two-person rule. The
//! result carries everything handlers need to pick the right error code.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::RwLock;

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::allow_if::{self, AuthContext};
use crate::approvals::ApprovalGrant;
use crate::error::Result;

/// Auth block of a function descriptor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthDescriptor {
    /// Permission string, `function:<id>` when empty.
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub allow_if: String,
    #[serde(default)]
    pub risk: Option<RiskPolicy>,
    #[serde(default)]
    pub two_person_rule: Option<TwoPersonRulePolicy>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// One of low, medium, high, critical.
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub requires_mfa: bool,
    /// `business_hours` restricts high-risk calls to Mon-Fri 09:00-17:00.
    #[serde(default)]
    pub time_window: String,
    /// Extra `allow_if` expressions, all must hold.
    #[serde(default)]
    pub conditions: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TwoPersonRulePolicy {
    #[serde(default)]
    pub required: bool,
    /// Roles allowed to approve; empty accepts any role.
    #[serde(default)]
    pub approvers: Vec<String>,
    /// Approvals needed, defaults to 1.
    #[serde(default)]
    pub threshold: u32,
    /// How long an approval stays valid ("1h", "24h", "1w", "30m", ...).
    #[serde(default)]
    pub expiry_time: String,
    /// The rule only applies when one of these expressions holds.
    #[serde(default)]
    pub conditions: Vec<String>,
}

/// Subject -> granted permissions. Subjects are user ids or `role:<name>`.
#[derive(Default)]
pub struct Policy {
    allow: RwLock<HashMap<String, HashSet<String>>>,
}

#[derive(Debug, Default, Deserialize)]
struct PolicyFile {
    #[serde(default)]
    allow: HashMap<String, Vec<String>>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file: PolicyFile = serde_json::from_slice(&bytes)?;
        let policy = Self::new();
        for (subject, perms) in file.allow {
            for perm in perms {
                policy.grant(&subject, &perm);
            }
        }
        Ok(policy)
    }

    pub fn grant(&self, subject: &str, permission: &str) {
        let mut allow = self.allow.write().unwrap_or_else(|e| e.into_inner());
        allow
            .entry(subject.to_string())
            .or_default()
            .insert(permission.to_string());
    }

    /// Direct grant check: the exact permission or `*`.
    pub fn can(&self, subject: &str, permission: &str) -> bool {
        let allow = self.allow.read().unwrap_or_else(|e| e.into_inner());
        allow
            .get(subject)
            .is_some_and(|perms| perms.contains(permission) || perms.contains("*"))
    }

    /// Scoped invocation check across a user and their roles. Any of the
    /// scoped permission, the plain permission, the game wildcard, or the
    /// global wildcard admits the call.
    pub fn can_invoke(&self, user: &str, roles: &[String], game_id: &str, permission: &str) -> bool {
        let mut subjects = vec![user.to_string()];
        subjects.extend(roles.iter().map(|r| format!("role:{}", r)));

        let mut wanted = vec![permission.to_string()];
        if !game_id.is_empty() {
            wanted.push(format!("game:{}:{}", game_id, permission));
            wanted.push(format!("game:{}:*", game_id));
        }

        let allow = self.allow.read().unwrap_or_else(|e| e.into_inner());
        subjects.iter().any(|s| {
            allow.get(s).is_some_and(|perms| {
                perms.contains("*") || wanted.iter().any(|w| perms.contains(w))
            })
        })
    }
}

/// One authorization question.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub function_id: String,
    pub user: String,
    pub roles: Vec<String>,
    pub game_id: String,
    /// Invocation payload fields, referenced as `resource.*`.
    pub parameters: serde_json::Map<String, Value>,
    /// Request metadata, referenced as `request.*`.
    pub context: serde_json::Map<String, Value>,
    pub approvals: Vec<ApprovalGrant>,
    pub request_time: DateTime<Utc>,
    /// Local wall time for time-window evaluation.
    pub wall_time: NaiveDateTime,
}

impl AuthorizationRequest {
    pub fn new(function_id: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            function_id: function_id.into(),
            user: user.into(),
            roles: Vec::new(),
            game_id: String::new(),
            parameters: serde_json::Map::new(),
            context: serde_json::Map::new(),
            approvals: Vec::new(),
            request_time: Utc::now(),
            wall_time: chrono::Local::now().naive_local(),
        }
    }
}

/// Why a request was denied, for error-code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    Permission,
    AllowIf,
    OutOfWindow,
    RiskCondition,
    NeedsApproval,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationResult {
    pub allowed: bool,
    pub requires_approval: bool,
    pub requires_mfa: bool,
    pub risk_level: String,
    pub reason: String,
    pub required_approvals: u32,
    pub existing_approvals: u32,
    pub conditions: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub denial: Option<Denial>,
}

impl AuthorizationResult {
    fn denied(reason: String, denial: Denial) -> Self {
        Self {
            allowed: false,
            requires_approval: denial == Denial::NeedsApproval,
            requires_mfa: false,
            risk_level: "low".to_string(),
            reason,
            required_approvals: 0,
            existing_approvals: 0,
            conditions: Vec::new(),
            expires_at: None,
            denial: Some(denial),
        }
    }
}

/// Full authorization pipeline over one policy.
pub struct UnifiedPolicyEngine {
    policy: Policy,
}

impl UnifiedPolicyEngine {
    pub fn new(policy: Policy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn authorize(
        &self,
        auth: &AuthDescriptor,
        request: &AuthorizationRequest,
    ) -> AuthorizationResult {
        let permission = if auth.permission.is_empty() {
            format!("function:{}", request.function_id)
        } else {
            auth.permission.clone()
        };

        if !self
            .policy
            .can_invoke(&request.user, &request.roles, &request.game_id, &permission)
        {
            return AuthorizationResult::denied(
                format!("missing required permission: {}", permission),
                Denial::Permission,
            );
        }

        let ctx = self.auth_context(request);

        if !auth.allow_if.is_empty()
            && !allow_if::evaluate(&auth.allow_if, &ctx, &self.policy)
        {
            return AuthorizationResult::denied(
                "denied by allow_if condition".to_string(),
                Denial::AllowIf,
            );
        }

        let mut requires_mfa = false;
        let mut risk_level = "low".to_string();
        let mut conditions = Vec::new();

        if let Some(risk) = &auth.risk {
            risk_level = risk.level.clone();
            requires_mfa = risk.requires_mfa;
            match risk.level.as_str() {
                "critical" => {
                    requires_mfa = true;
                    conditions.push("critical_operation_logged".to_string());
                }
                "high" => {
                    if risk.time_window == "business_hours"
                        && !is_business_hours(request.wall_time)
                    {
                        let mut result = AuthorizationResult::denied(
                            "high-risk operations only allowed during business hours".to_string(),
                            Denial::OutOfWindow,
                        );
                        result.risk_level = risk_level;
                        return result;
                    }
                }
                "medium" => conditions.push("audit_logged".to_string()),
                _ => {}
            }
            for condition in &risk.conditions {
                if !allow_if::evaluate(condition, &ctx, &self.policy) {
                    let mut result = AuthorizationResult::denied(
                        format!("risk condition failed: {}", condition),
                        Denial::RiskCondition,
                    );
                    result.risk_level = risk_level;
                    return result;
                }
            }
        }

        let mut requires_approval = false;
        let mut required_approvals = 0;
        let mut expires_at = None;

        if let Some(rule) = &auth.two_person_rule
            && rule.required
        {
            let applies = rule.conditions.is_empty()
                || rule
                    .conditions
                    .iter()
                    .any(|c| allow_if::evaluate(c, &ctx, &self.policy));

            if applies {
                requires_approval = true;
                required_approvals = rule.threshold.max(1);
                let valid = count_valid_approvals(rule, &request.approvals, request.request_time);
                if valid < required_approvals {
                    let mut result = AuthorizationResult::denied(
                        format!(
                            "requires {} approval(s), have {}",
                            required_approvals, valid
                        ),
                        Denial::NeedsApproval,
                    );
                    result.requires_mfa = requires_mfa;
                    result.risk_level = risk_level;
                    result.required_approvals = required_approvals;
                    result.existing_approvals = valid;
                    result.conditions = conditions;
                    return result;
                }
            }
            if let Some(ttl) = parse_expiry(&rule.expiry_time) {
                expires_at = Some(request.request_time + ttl);
            }
        }

        AuthorizationResult {
            allowed: true,
            requires_approval,
            requires_mfa,
            risk_level,
            reason: "authorization granted".to_string(),
            required_approvals,
            existing_approvals: request.approvals.len() as u32,
            conditions,
            expires_at,
            denial: None,
        }
    }

    fn auth_context(&self, request: &AuthorizationRequest) -> AuthContext {
        let mut ctx = AuthContext::new(request.user.clone(), request.wall_time);
        ctx.roles = request.roles.clone();
        ctx.resource = request.parameters.clone();
        ctx.request = request.context.clone();
        ctx
    }
}

fn count_valid_approvals(
    rule: &TwoPersonRulePolicy,
    approvals: &[ApprovalGrant],
    request_time: DateTime<Utc>,
) -> u32 {
    let ttl = parse_expiry(&rule.expiry_time);
    approvals
        .iter()
        .filter(|a| match ttl {
            Some(ttl) => request_time.signed_duration_since(a.timestamp) <= ttl,
            None => true,
        })
        .filter(|a| rule.approvers.is_empty() || rule.approvers.contains(&a.role))
        .count() as u32
}

/// Mon-Fri, 09:00-17:00.
fn is_business_hours(now: NaiveDateTime) -> bool {
    !matches!(now.weekday(), Weekday::Sat | Weekday::Sun) && (9..17).contains(&now.hour())
}

/// Named windows plus `<n><s|m|h|d>` shorthand. Unknown strings disable
/// expiry.
fn parse_expiry(s: &str) -> Option<chrono::Duration> {
    match s {
        "" => None,
        "1h" | "1 hour" => Some(chrono::Duration::hours(1)),
        "24h" | "1 day" => Some(chrono::Duration::hours(24)),
        "1w" | "1 week" => Some(chrono::Duration::weeks(1)),
        other => {
            let (num, unit) = other.split_at(other.len().saturating_sub(1));
            let n: i64 = num.parse().ok().filter(|n| *n > 0)?;
            match unit {
                "s" => Some(chrono::Duration::seconds(n)),
                "m" => Some(chrono::Duration::minutes(n)),
                "h" => Some(chrono::Duration::hours(n)),
                "d" => Some(chrono::Duration::days(n)),
                _ => None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn engine_with_grant(subject: &str, perm: &str) -> UnifiedPolicyEngine {
        let policy = Policy::new();
        policy.grant(subject, perm);
        UnifiedPolicyEngine::new(policy)
    }

    fn request(user: &str, fid: &str) -> AuthorizationRequest {
        let mut req = AuthorizationRequest::new(fid, user);
        req.game_id = "poker".to_string();
        // a Tuesday at 10:30
        req.wall_time = NaiveDate::from_ymd_opt(2025, 3, 11)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        req
    }

    fn grant(role: &str, age_minutes: i64) -> ApprovalGrant {
        ApprovalGrant {
            approver_id: format!("approver-{}", role),
            role: role.to_string(),
            timestamp: Utc::now() - chrono::Duration::minutes(age_minutes),
        }
    }

    #[test]
    fn test_default_permission_is_function_scoped() {
        let engine = engine_with_grant("ops-1", "function:table.close");
        let result = engine.authorize(&AuthDescriptor::default(), &request("ops-1", "table.close"));
        assert!(result.allowed);

        let result = engine.authorize(&AuthDescriptor::default(), &request("ops-1", "player.kick"));
        assert!(!result.allowed);
        assert_eq!(result.denial, Some(Denial::Permission));
    }

    #[test]
    fn test_permission_forms() {
        let req = request("ops-1", "table.close");
        let auth = AuthDescriptor::default();

        for grant in [
            "function:table.close",
            "game:poker:function:table.close",
            "game:poker:*",
            "*",
        ] {
            let engine = engine_with_grant("ops-1", grant);
            assert!(engine.authorize(&auth, &req).allowed, "grant {}", grant);
        }

        // role-held grant
        let engine = engine_with_grant("role:sre", "function:table.close");
        let mut req = request("ops-1", "table.close");
        req.roles = vec!["sre".to_string()];
        assert!(engine.authorize(&auth, &req).allowed);
    }

    #[test]
    fn test_allow_if_denial() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            allow_if: "resource.stake < 10".to_string(),
            ..AuthDescriptor::default()
        };
        let mut req = request("ops-1", "table.close");
        req.parameters.insert("stake".to_string(), json!(50));

        let result = engine.authorize(&auth, &req);
        assert!(!result.allowed);
        assert_eq!(result.denial, Some(Denial::AllowIf));
    }

    #[test]
    fn test_high_risk_business_hours() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            risk: Some(RiskPolicy {
                level: "high".to_string(),
                time_window: "business_hours".to_string(),
                ..RiskPolicy::default()
            }),
            ..AuthDescriptor::default()
        };

        // Tuesday 10:30 passes
        assert!(engine.authorize(&auth, &request("ops-1", "f")).allowed);

        // Saturday is rejected
        let mut weekend = request("ops-1", "f");
        weekend.wall_time = NaiveDate::from_ymd_opt(2025, 3, 15)
            .unwrap()
            .and_hms_opt(10, 30, 0)
            .unwrap();
        let result = engine.authorize(&auth, &weekend);
        assert_eq!(result.denial, Some(Denial::OutOfWindow));

        // Tuesday 18:00 is rejected
        let mut evening = request("ops-1", "f");
        evening.wall_time = NaiveDate::from_ymd_opt(2025, 3, 11)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap();
        assert_eq!(
            engine.authorize(&auth, &evening).denial,
            Some(Denial::OutOfWindow)
        );
    }

    #[test]
    fn test_critical_risk_forces_mfa_and_condition() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            risk: Some(RiskPolicy {
                level: "critical".to_string(),
                ..RiskPolicy::default()
            }),
            ..AuthDescriptor::default()
        };
        let result = engine.authorize(&auth, &request("ops-1", "f"));
        assert!(result.allowed);
        assert!(result.requires_mfa);
        assert!(result
            .conditions
            .contains(&"critical_operation_logged".to_string()));
    }

    #[test]
    fn test_medium_risk_tags_audit() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            risk: Some(RiskPolicy {
                level: "medium".to_string(),
                ..RiskPolicy::default()
            }),
            ..AuthDescriptor::default()
        };
        let result = engine.authorize(&auth, &request("ops-1", "f"));
        assert!(result.allowed);
        assert!(result.conditions.contains(&"audit_logged".to_string()));
    }

    #[test]
    fn test_risk_condition_failure() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            risk: Some(RiskPolicy {
                level: "low".to_string(),
                conditions: vec!["has_role(\"sre\")".to_string()],
                ..RiskPolicy::default()
            }),
            ..AuthDescriptor::default()
        };
        let result = engine.authorize(&auth, &request("ops-1", "f"));
        assert_eq!(result.denial, Some(Denial::RiskCondition));
    }

    #[test]
    fn test_two_person_rule_requires_threshold() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            two_person_rule: Some(TwoPersonRulePolicy {
                required: true,
                threshold: 2,
                approvers: vec!["sre".to_string()],
                expiry_time: "1h".to_string(),
                ..TwoPersonRulePolicy::default()
            }),
            ..AuthDescriptor::default()
        };

        let mut req = request("ops-1", "f");
        let result = engine.authorize(&auth, &req);
        assert_eq!(result.denial, Some(Denial::NeedsApproval));
        assert!(result.requires_approval);
        assert_eq!(result.required_approvals, 2);
        assert_eq!(result.existing_approvals, 0);

        // one fresh grant is not enough
        req.approvals = vec![grant("sre", 5)];
        assert!(!engine.authorize(&auth, &req).allowed);

        // two fresh grants pass
        req.approvals = vec![grant("sre", 5), grant("sre", 10)];
        let result = engine.authorize(&auth, &req);
        assert!(result.allowed);
        assert!(result.expires_at.is_some());
    }

    #[test]
    fn test_two_person_rule_filters_expired_and_wrong_role() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            two_person_rule: Some(TwoPersonRulePolicy {
                required: true,
                threshold: 1,
                approvers: vec!["sre".to_string()],
                expiry_time: "1h".to_string(),
                ..TwoPersonRulePolicy::default()
            }),
            ..AuthDescriptor::default()
        };

        let mut req = request("ops-1", "f");
        req.approvals = vec![grant("sre", 120), grant("intern", 5)];
        let result = engine.authorize(&auth, &req);
        assert_eq!(result.denial, Some(Denial::NeedsApproval));
        assert_eq!(result.existing_approvals, 0);
    }

    #[test]
    fn test_two_person_rule_conditions_gate_applicability() {
        let engine = engine_with_grant("ops-1", "*");
        let auth = AuthDescriptor {
            two_person_rule: Some(TwoPersonRulePolicy {
                required: true,
                threshold: 1,
                conditions: vec!["resource.amount > 1000".to_string()],
                ..TwoPersonRulePolicy::default()
            }),
            ..AuthDescriptor::default()
        };

        // condition not met, rule does not apply
        let mut small = request("ops-1", "f");
        small.parameters.insert("amount".to_string(), json!(10));
        assert!(engine.authorize(&auth, &small).allowed);

        // condition met, approval required
        let mut big = request("ops-1", "f");
        big.parameters.insert("amount".to_string(), json!(5000));
        assert_eq!(
            engine.authorize(&auth, &big).denial,
            Some(Denial::NeedsApproval)
        );
    }

    #[test]
    fn test_parse_expiry_variants() {
        assert_eq!(parse_expiry("1h"), Some(chrono::Duration::hours(1)));
        assert_eq!(parse_expiry("1 day"), Some(chrono::Duration::hours(24)));
        assert_eq!(parse_expiry("1w"), Some(chrono::Duration::weeks(1)));
        assert_eq!(parse_expiry("30m"), Some(chrono::Duration::minutes(30)));
        assert_eq!(parse_expiry(""), None);
        assert_eq!(parse_expiry("soon"), None);
    }

    #[test]
    fn test_policy_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"allow": {"ops-1": ["function:table.close"], "role:sre": ["*"]}}"#,
        )
        .unwrap();

        let policy = Policy::load_file(&path).unwrap();
        assert!(policy.can("ops-1", "function:table.close"));
        assert!(policy.can("role:sre", "anything"));
        assert!(!policy.can("ops-2", "function:table.close"));
    }
}
