// Copyright (C) 2025 Croupier Contributors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Control- and function-plane request handlers.
//!
//! The control plane admits agents past the games gate and keeps their
//! leases. The function plane runs the full invocation pipeline: descriptor
//! validation, assignment gate, policy, audit, then routing. Denied calls
//! never reach an agent.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use croupier_proto::control;
use croupier_proto::function::{self, InvokeRequest, JobEvent};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approvals::{Approval, ApprovalState, ApprovalStore};
use crate::assignments::AssignmentStore;
use crate::audit::AuditWriter;
use crate::descriptor::DescriptorStore;
use crate::error::{CoreError, Result};
use crate::games::GameStore;
use crate::policy::{AuthorizationRequest, Denial, UnifiedPolicyEngine};
use crate::registry::{AgentSession, FunctionMeta, Registry, lease};
use crate::router::{AgentTransport, Router};
use crate::stats::HealthChecker;

/// Serves agent registration, heartbeats and assignment polling.
pub struct ControlHandler {
    registry: Arc<Registry>,
    games: Arc<GameStore>,
    assignments: Arc<AssignmentStore>,
    health: Arc<HealthChecker>,
}

impl ControlHandler {
    pub fn new(
        registry: Arc<Registry>,
        games: Arc<GameStore>,
        assignments: Arc<AssignmentStore>,
        health: Arc<HealthChecker>,
    ) -> Self {
        Self {
            registry,
            games,
            assignments,
            health,
        }
    }

    pub fn handle(&self, request: control::RpcRequest) -> control::RpcResponse {
        let response = match request.request {
            Some(control::rpc_request::Request::Register(req)) => {
                self.register(req).map(control::rpc_response::Response::Register)
            }
            Some(control::rpc_request::Request::Heartbeat(req)) => {
                self.heartbeat(req).map(control::rpc_response::Response::Heartbeat)
            }
            Some(control::rpc_request::Request::GetAssignments(req)) => Ok(
                control::rpc_response::Response::GetAssignments(self.get_assignments(req)),
            ),
            None => Err(CoreError::BadRequest("empty control request".to_string())),
        };
        control::RpcResponse {
            response: Some(response.unwrap_or_else(|err| {
                control::rpc_response::Response::Error(err.to_rpc_error())
            })),
        }
    }

    fn register(&self, req: control::RegisterRequest) -> Result<control::RegisterResponse> {
        if req.agent_id.is_empty() {
            return Err(CoreError::BadRequest("agent_id is required".to_string()));
        }
        if req.rpc_addr.is_empty() {
            return Err(CoreError::BadRequest("rpc_addr is required".to_string()));
        }
        if !self.games.is_allowed(&req.game_id, &req.env) {
            return Err(CoreError::Forbidden(format!(
                "game '{}' not allowed in env '{}'",
                req.game_id, req.env
            )));
        }

        let session_id = Uuid::new_v4().to_string();
        let expire_at = Utc::now() + lease();
        let functions = req
            .functions
            .into_iter()
            .map(|spec| {
                (
                    spec.id,
                    FunctionMeta {
                        entity: spec.entity,
                        operation: spec.operation,
                        enabled: spec.enabled,
                    },
                )
            })
            .collect();
        let session = AgentSession {
            agent_id: req.agent_id.clone(),
            version: req.version,
            rpc_addr: req.rpc_addr,
            game_id: req.game_id,
            env: req.env,
            region: req.region,
            zone: req.zone,
            labels: req.labels,
            functions,
            session_id: session_id.clone(),
            expire_at,
        };
        info!(
            agent_id = %session.agent_id,
            game_id = %session.game_id,
            env = %session.env,
            functions = session.functions.len(),
            "agent registered"
        );
        self.registry.upsert(session);
        // a fresh registration clears any earlier health demotion
        self.health.forget(&req.agent_id);

        Ok(control::RegisterResponse {
            session_id,
            expire_at: expire_at.timestamp(),
        })
    }

    fn heartbeat(&self, req: control::HeartbeatRequest) -> Result<control::HeartbeatResponse> {
        let Some(agent) = self.registry.get(&req.agent_id) else {
            // the agent re-registers on this error
            return Err(CoreError::BadRequest(format!(
                "agent '{}' is not registered",
                req.agent_id
            )));
        };
        if agent.session_id != req.session_id {
            return Err(CoreError::BadRequest(format!(
                "stale session for agent '{}'",
                req.agent_id
            )));
        }
        self.registry.heartbeat(&req.agent_id);
        Ok(control::HeartbeatResponse {})
    }

    fn get_assignments(
        &self,
        req: control::GetAssignmentsRequest,
    ) -> control::GetAssignmentsResponse {
        control::GetAssignmentsResponse {
            function_ids: self.assignments.get(&req.game_id, &req.env),
        }
    }
}

/// Caller identity carried in invocation metadata.
struct Identity {
    actor: String,
    roles: Vec<String>,
    mfa_verified: bool,
    game_id: String,
    env: String,
}

impl Identity {
    fn from_metadata(metadata: &std::collections::HashMap<String, String>) -> Result<Self> {
        let actor = metadata.get("actor").cloned().unwrap_or_default();
        if actor.is_empty() {
            return Err(CoreError::BadRequest(
                "metadata 'actor' is required".to_string(),
            ));
        }
        let roles = metadata
            .get("roles")
            .map(|r| {
                r.split(',')
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Self {
            actor,
            roles,
            mfa_verified: metadata.get("mfa_verified").map(String::as_str) == Some("true"),
            game_id: metadata.get("game_id").cloned().unwrap_or_default(),
            env: metadata.get("env").cloned().unwrap_or_default(),
        })
    }
}

/// Serves invocations and job operations.
pub struct FunctionHandler<T: AgentTransport> {
    descriptors: Arc<DescriptorStore>,
    assignments: Arc<AssignmentStore>,
    engine: Arc<UnifiedPolicyEngine>,
    approvals: Arc<ApprovalStore>,
    audit: Arc<AuditWriter>,
    router: Arc<Router<T>>,
}

impl<T: AgentTransport> FunctionHandler<T> {
    pub fn new(
        descriptors: Arc<DescriptorStore>,
        assignments: Arc<AssignmentStore>,
        engine: Arc<UnifiedPolicyEngine>,
        approvals: Arc<ApprovalStore>,
        audit: Arc<AuditWriter>,
        router: Arc<Router<T>>,
    ) -> Self {
        Self {
            descriptors,
            assignments,
            engine,
            approvals,
            audit,
            router,
        }
    }

    /// Dispatch one unary function-plane request. `StreamJob` is handled at
    /// the stream level via [`FunctionHandler::stream_job`].
    pub async fn handle(&self, request: function::RpcRequest) -> function::RpcResponse {
        let response = match request.request {
            Some(function::rpc_request::Request::Invoke(req)) => self
                .invoke(req)
                .await
                .map(function::rpc_response::Response::Invoke),
            Some(function::rpc_request::Request::StartJob(req)) => self
                .start_job(req)
                .await
                .map(function::rpc_response::Response::StartJob),
            Some(function::rpc_request::Request::CancelJob(req)) => self
                .cancel_job(req)
                .await
                .map(function::rpc_response::Response::CancelJob),
            Some(function::rpc_request::Request::GetJobResult(req)) => self
                .router
                .get_job_result(&req.job_id)
                .await
                .map(function::rpc_response::Response::GetJobResult),
            Some(function::rpc_request::Request::ListLocal(_)) => Err(CoreError::BadRequest(
                "list_local is served by agents".to_string(),
            )),
            Some(function::rpc_request::Request::StreamJob(_)) => Err(CoreError::BadRequest(
                "stream_job requires a streaming exchange".to_string(),
            )),
            None => Err(CoreError::BadRequest("empty function request".to_string())),
        };
        function::RpcResponse {
            response: Some(response.unwrap_or_else(|err| {
                function::rpc_response::Response::Error(err.to_rpc_error())
            })),
        }
    }

    pub async fn invoke(&self, request: InvokeRequest) -> Result<function::InvokeResponse> {
        self.admit(&request, "invoke").await?;
        self.router.invoke(request).await
    }

    pub async fn start_job(&self, request: InvokeRequest) -> Result<function::StartJobResponse> {
        self.admit(&request, "job_start").await?;
        self.router.start_job(request).await
    }

    pub async fn cancel_job(
        &self,
        request: function::CancelJobRequest,
    ) -> Result<function::CancelJobResponse> {
        let mut meta = BTreeMap::new();
        meta.insert("job_id".to_string(), request.job_id.clone());
        if !request.reason.is_empty() {
            meta.insert("reason".to_string(), request.reason.clone());
        }
        self.audit.log("job_cancel", "", &request.job_id, meta)?;
        self.router.cancel_job(&request.job_id, &request.reason).await
    }

    pub async fn stream_job(&self, job_id: &str) -> Result<mpsc::Receiver<JobEvent>> {
        self.router.stream_job(job_id).await
    }

    /// The admission pipeline shared by `Invoke` and `StartJob`. Ordering is
    /// load-bearing: unknown functions and bad payloads fail before policy,
    /// and nothing is dialed until the audit record is durable.
    async fn admit(&self, request: &InvokeRequest, kind: &str) -> Result<()> {
        let identity = Identity::from_metadata(&request.metadata)?;
        let descriptor = self
            .descriptors
            .validate_invocation(&request.function_id, &request.payload)?;

        if !self
            .assignments
            .allows(&identity.game_id, &identity.env, &request.function_id)
        {
            return Err(CoreError::Forbidden(format!(
                "function '{}' is not assigned to game '{}' env '{}'",
                request.function_id, identity.game_id, identity.env
            )));
        }

        let auth = descriptor.auth.clone().unwrap_or_default();
        let mut auth_request = AuthorizationRequest::new(&request.function_id, &identity.actor);
        auth_request.roles = identity.roles.clone();
        auth_request.game_id = identity.game_id.clone();
        if let Ok(Value::Object(fields)) = serde_json::from_slice(&request.payload) {
            auth_request.parameters = fields;
        }
        auth_request.context = request
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        auth_request.approvals = self
            .approvals
            .grants_for(&request.function_id, &request.idempotency_key);

        let result = self.engine.authorize(&auth, &auth_request);
        if !result.allowed {
            self.log_denied(request, &identity, kind, &result.reason);
            return Err(match result.denial {
                Some(Denial::OutOfWindow) => CoreError::OutOfWindow(result.reason),
                Some(Denial::NeedsApproval) => {
                    self.park_for_approval(request, &identity);
                    CoreError::RequiresApproval(result.reason)
                }
                _ => CoreError::Forbidden(result.reason),
            });
        }
        if result.requires_mfa && !identity.mfa_verified {
            self.log_denied(request, &identity, kind, "mfa required");
            return Err(CoreError::RequiresMfa(format!(
                "function '{}' requires a verified MFA session",
                request.function_id
            )));
        }

        let mut meta = BTreeMap::new();
        meta.insert("game_id".to_string(), identity.game_id.clone());
        meta.insert("env".to_string(), identity.env.clone());
        meta.insert("risk".to_string(), result.risk_level.clone());
        if !request.idempotency_key.is_empty() {
            meta.insert(
                "idempotency_key".to_string(),
                request.idempotency_key.clone(),
            );
        }
        for condition in &result.conditions {
            meta.insert(format!("condition:{}", condition), "true".to_string());
        }
        // an unwritable audit log blocks the call
        self.audit
            .log(kind, &identity.actor, &request.function_id, meta)?;
        Ok(())
    }

    /// Park the denied call so out-of-band sign-offs can attach to a retry
    /// with the same idempotency key.
    fn park_for_approval(&self, request: &InvokeRequest, identity: &Identity) {
        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            actor: identity.actor.clone(),
            function_id: request.function_id.clone(),
            idempotency_key: request.idempotency_key.clone(),
            game_id: identity.game_id.clone(),
            env: identity.env.clone(),
            state: ApprovalState::Pending,
            reason: String::new(),
            grants: Vec::new(),
        };
        if let Err(err) = self.approvals.create(approval) {
            warn!(%err, function_id = %request.function_id, "failed to park approval");
        }
    }

    /// Denied attempts are logged best effort; the denial itself is the
    /// outcome that must not be lost.
    fn log_denied(&self, request: &InvokeRequest, identity: &Identity, kind: &str, reason: &str) {
        let mut meta = BTreeMap::new();
        meta.insert("game_id".to_string(), identity.game_id.clone());
        meta.insert("env".to_string(), identity.env.clone());
        meta.insert("reason".to_string(), reason.to_string());
        if let Err(err) = self.audit.log(
            &format!("{}_denied", kind),
            &identity.actor,
            &request.function_id,
            meta,
        ) {
            warn!(%err, "failed to write denial audit entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::balancer;
    use crate::limiter::RateLimiter;
    use crate::policy::Policy;
    use crate::registry::test_session;
    use crate::router::testutil::MockTransport;
    use crate::stats::StatsCollector;

    fn control_fixture() -> (ControlHandler, Arc<Registry>, Arc<GameStore>, Arc<AssignmentStore>)
    {
        let registry = Arc::new(Registry::new());
        let games = Arc::new(GameStore::new());
        let assignments = Arc::new(AssignmentStore::new());
        let health = Arc::new(HealthChecker::new());
        let handler = ControlHandler::new(
            registry.clone(),
            games.clone(),
            assignments.clone(),
            health,
        );
        (handler, registry, games, assignments)
    }

    fn register_request(agent_id: &str, game_id: &str, env: &str) -> control::RpcRequest {
        control::RpcRequest {
            request: Some(control::rpc_request::Request::Register(
                control::RegisterRequest {
                    agent_id: agent_id.to_string(),
                    version: "0.3.0".to_string(),
                    rpc_addr: "10.0.0.5:7301".to_string(),
                    game_id: game_id.to_string(),
                    env: env.to_string(),
                    region: String::new(),
                    zone: String::new(),
                    labels: HashMap::new(),
                    functions: vec![control::FunctionSpec {
                        id: "table.close".to_string(),
                        entity: "table".to_string(),
                        operation: "close".to_string(),
                        enabled: true,
                    }],
                },
            )),
        }
    }

    fn unwrap_register(response: control::RpcResponse) -> control::RegisterResponse {
        match response.response {
            Some(control::rpc_response::Response::Register(r)) => r,
            other => panic!("expected register response, got {:?}", other),
        }
    }

    fn unwrap_control_error(response: control::RpcResponse) -> croupier_proto::common::RpcError {
        match response.response {
            Some(control::rpc_response::Response::Error(e)) => e,
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_register_issues_session_and_lease() {
        let (handler, registry, _, _) = control_fixture();
        let resp = unwrap_register(handler.handle(register_request("agent-1", "poker", "prod")));

        assert!(!resp.session_id.is_empty());
        assert!(resp.expire_at > Utc::now().timestamp());

        let session = registry.get("agent-1").unwrap();
        assert_eq!(session.session_id, resp.session_id);
        assert_eq!(session.functions.len(), 1);
    }

    #[test]
    fn test_register_enforces_games_gate() {
        let (handler, registry, games, _) = control_fixture();
        games.add("poker", "prod");

        let err = unwrap_control_error(handler.handle(register_request("agent-1", "chess", "prod")));
        assert_eq!(err.code, "FORBIDDEN");
        assert!(registry.get("agent-1").is_none());

        unwrap_register(handler.handle(register_request("agent-2", "poker", "prod")));
    }

    #[test]
    fn test_register_requires_agent_id_and_addr() {
        let (handler, _, _, _) = control_fixture();
        let err = unwrap_control_error(handler.handle(register_request("", "poker", "prod")));
        assert_eq!(err.code, "BAD_REQUEST");
    }

    #[test]
    fn test_heartbeat_validates_session() {
        let (handler, _, _, _) = control_fixture();
        let registered =
            unwrap_register(handler.handle(register_request("agent-1", "poker", "prod")));

        let ok = handler.handle(control::RpcRequest {
            request: Some(control::rpc_request::Request::Heartbeat(
                control::HeartbeatRequest {
                    agent_id: "agent-1".to_string(),
                    session_id: registered.session_id,
                },
            )),
        });
        assert!(matches!(
            ok.response,
            Some(control::rpc_response::Response::Heartbeat(_))
        ));

        let stale = unwrap_control_error(handler.handle(control::RpcRequest {
            request: Some(control::rpc_request::Request::Heartbeat(
                control::HeartbeatRequest {
                    agent_id: "agent-1".to_string(),
                    session_id: "bogus".to_string(),
                },
            )),
        }));
        assert_eq!(stale.code, "BAD_REQUEST");

        let unknown = unwrap_control_error(handler.handle(control::RpcRequest {
            request: Some(control::rpc_request::Request::Heartbeat(
                control::HeartbeatRequest {
                    agent_id: "ghost".to_string(),
                    session_id: "s".to_string(),
                },
            )),
        }));
        assert_eq!(unknown.code, "BAD_REQUEST");
    }

    #[test]
    fn test_get_assignments_round_trip() {
        let (handler, _, _, assignments) = control_fixture();
        assignments.update(
            "poker",
            "prod",
            &["table.close".to_string()],
            |_| true,
        );

        let response = handler.handle(control::RpcRequest {
            request: Some(control::rpc_request::Request::GetAssignments(
                control::GetAssignmentsRequest {
                    game_id: "poker".to_string(),
                    env: "prod".to_string(),
                },
            )),
        });
        match response.response {
            Some(control::rpc_response::Response::GetAssignments(r)) => {
                assert_eq!(r.function_ids, vec!["table.close".to_string()]);
            }
            other => panic!("expected assignments, got {:?}", other),
        }
    }

    struct FunctionFixture {
        handler: FunctionHandler<MockTransport>,
        registry: Arc<Registry>,
        assignments: Arc<AssignmentStore>,
        approvals: Arc<ApprovalStore>,
        policy: Arc<UnifiedPolicyEngine>,
        audit_path: std::path::PathBuf,
        _dir: tempfile::TempDir,
    }

    fn function_fixture() -> FunctionFixture {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("table_close.json"),
            serde_json::json!({
                "id": "table.close",
                "version": "1.0.0",
                "risk": "high",
                "params": {
                    "type": "object",
                    "required": ["table_id"],
                    "properties": {"table_id": {"type": "string"}}
                },
                "auth": {"permission": "table:close"}
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("vault_drain.json"),
            serde_json::json!({
                "id": "vault.drain",
                "version": "1.0.0",
                "auth": {
                    "permission": "vault:drain",
                    "two_person_rule": {"required": true, "threshold": 2}
                }
            })
            .to_string(),
        )
        .unwrap();
        let descriptors = Arc::new(DescriptorStore::new());
        descriptors.load_dir(dir.path()).unwrap();

        let policy = Policy::new();
        policy.grant("ops-1", "table:close");
        policy.grant("ops-1", "vault:drain");
        let engine = Arc::new(UnifiedPolicyEngine::new(policy));

        let registry = Arc::new(Registry::new());
        let stats = Arc::new(StatsCollector::new());
        let health = Arc::new(HealthChecker::new());
        let limiter = Arc::new(RateLimiter::new());
        let balancer = balancer::from_name("round_robin", health.clone(), stats.clone()).unwrap();
        let router = Arc::new(Router::new(
            Arc::new(MockTransport::default()),
            registry.clone(),
            balancer,
            stats,
            health,
            limiter,
        ));

        let assignments = Arc::new(AssignmentStore::new());
        let approvals = Arc::new(ApprovalStore::new());
        let audit_path = dir.path().join("audit.log");
        let audit = Arc::new(AuditWriter::open(&audit_path).unwrap());

        FunctionFixture {
            handler: FunctionHandler::new(
                descriptors,
                assignments.clone(),
                engine.clone(),
                approvals.clone(),
                audit,
                router,
            ),
            registry,
            assignments,
            approvals,
            policy: engine,
            audit_path,
            _dir: dir,
        }
    }

    fn invoke(function_id: &str, actor: &str, payload: &str) -> InvokeRequest {
        InvokeRequest {
            function_id: function_id.to_string(),
            payload: payload.as_bytes().to_vec(),
            idempotency_key: String::new(),
            metadata: HashMap::from([
                ("actor".to_string(), actor.to_string()),
                ("game_id".to_string(), "poker".to_string()),
                ("env".to_string(), "prod".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn test_invoke_full_pipeline() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["table.close"]));

        let resp = f
            .handler
            .invoke(invoke("table.close", "ops-1", r#"{"table_id":"t-1"}"#))
            .await
            .unwrap();
        assert_eq!(resp.agent_id, "agent-1");

        // the call left a verifiable audit trail
        let outcome = crate::audit::verify(&f.audit_path).unwrap();
        assert_eq!(outcome.entries, 1);
        assert!(outcome.is_intact());
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let f = function_fixture();
        let err = f
            .handler
            .invoke(invoke("no.such", "ops-1", "{}"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "UNKNOWN_FUNCTION");
    }

    #[tokio::test]
    async fn test_invoke_invalid_payload() {
        let f = function_fixture();
        let err = f
            .handler
            .invoke(invoke("table.close", "ops-1", "{}"))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "PAYLOAD_INVALID");
    }

    #[tokio::test]
    async fn test_invoke_requires_actor() {
        let f = function_fixture();
        let mut request = invoke("table.close", "ops-1", r#"{"table_id":"t-1"}"#);
        request.metadata.remove("actor");
        let err = f.handler.invoke(request).await.unwrap_err();
        assert_eq!(err.error_code(), "BAD_REQUEST");
    }

    #[tokio::test]
    async fn test_invoke_without_permission_is_forbidden_and_audited() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["table.close"]));

        let err = f
            .handler
            .invoke(invoke("table.close", "intruder", r#"{"table_id":"t-1"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let content = std::fs::read_to_string(&f.audit_path).unwrap();
        assert!(content.contains("invoke_denied"));
        assert!(content.contains("intruder"));
    }

    #[tokio::test]
    async fn test_invoke_respects_assignment_gate() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["table.close"]));
        f.assignments
            .update("poker", "prod", &["player.kick".to_string()], |_| true);

        let err = f
            .handler
            .invoke(invoke("table.close", "ops-1", r#"{"table_id":"t-1"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");
    }

    #[tokio::test]
    async fn test_two_person_rule_parks_and_replays_approvals() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["vault.drain"]));

        let mut request = invoke("vault.drain", "ops-1", "{}");
        request.idempotency_key = "k-drain-1".to_string();

        let err = f.handler.invoke(request.clone()).await.unwrap_err();
        assert_eq!(err.error_code(), "REQUIRES_APPROVAL");

        // the denied call was parked for sign-off
        let pending = f.approvals.list_pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].idempotency_key, "k-drain-1");

        // two approvers sign off out of band; the retry goes through
        f.approvals.approve(&pending[0].id, "lead-1", "sre").unwrap();
        f.approvals.approve(&pending[0].id, "lead-2", "sre").unwrap();
        let resp = f.handler.invoke(request).await.unwrap();
        assert_eq!(resp.agent_id, "agent-1");
    }

    #[tokio::test]
    async fn test_start_job_uses_same_pipeline() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["table.close"]));

        let err = f
            .handler
            .start_job(invoke("table.close", "intruder", r#"{"table_id":"t-1"}"#))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "FORBIDDEN");

        let started = f
            .handler
            .start_job(invoke("table.close", "ops-1", r#"{"table_id":"t-1"}"#))
            .await
            .unwrap();
        assert_eq!(started.job_id, "job-1");

        let cancelled = f
            .handler
            .cancel_job(function::CancelJobRequest {
                job_id: started.job_id,
                reason: "operator request".to_string(),
            })
            .await
            .unwrap();
        assert!(cancelled.cancelled);
    }

    #[tokio::test]
    async fn test_handle_maps_errors_to_rpc_error() {
        let f = function_fixture();
        let response = f
            .handler
            .handle(function::RpcRequest {
                request: Some(function::rpc_request::Request::Invoke(invoke(
                    "no.such", "ops-1", "{}",
                ))),
            })
            .await;
        match response.response {
            Some(function::rpc_response::Response::Error(e)) => {
                assert_eq!(e.code, "UNKNOWN_FUNCTION");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_local_rejected_at_this_tier() {
        let f = function_fixture();
        let response = f
            .handler
            .handle(function::RpcRequest {
                request: Some(function::rpc_request::Request::ListLocal(
                    function::ListLocalRequest {
                        function_id: "table.close".to_string(),
                    },
                )),
            })
            .await;
        match response.response {
            Some(function::rpc_response::Response::Error(e)) => {
                assert_eq!(e.code, "BAD_REQUEST");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_wildcard_permission_via_role() {
        let f = function_fixture();
        f.registry
            .upsert(test_session("agent-1", "poker", &["table.close"]));
        f.policy.policy().grant("role:admin", "*");

        let mut request = invoke("table.close", "root-1", r#"{"table_id":"t-1"}"#);
        request
            .metadata
            .insert("roles".to_string(), "admin".to_string());
        f.handler.invoke(request).await.unwrap();
    }
}
