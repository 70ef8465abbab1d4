//! HTTP surface: chat turns, lifecycle transitions, analysis
//! validation. Wire shapes are camelCase JSON; internal errors cross
//! the boundary only as the layered interface taxonomy.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use parley_agent::gate::EnforcementGate;
use parley_agent::runtime::{TurnRequest, TurnResponse, TurnRuntime};
use parley_core::audit::{AuditContext, AuditSink};
use parley_core::enforcement::{AnalysisProfile, GatePolicy, Violation};
use parley_core::errors::{ApplicationError, DomainError, InterfaceError};
use parley_core::lifecycle::{LifecycleEngine, LifecycleState, TransitionOutcome};
use parley_core::session::IdentityId;
use parley_db::repositories::LifecycleRepository;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<TurnRuntime>,
    pub gate: Arc<EnforcementGate>,
    pub lifecycle: Arc<LifecycleService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/chat/turn", post(chat_turn))
        .route("/api/v1/lifecycle/transition", post(lifecycle_transition))
        .route("/api/v1/analysis/validate", post(analysis_validate))
        .with_state(state)
}

pub struct LifecycleService {
    engine: LifecycleEngine,
    repository: Arc<dyn LifecycleRepository>,
    audit: Arc<dyn AuditSink>,
}

impl LifecycleService {
    pub fn new(
        engine: LifecycleEngine,
        repository: Arc<dyn LifecycleRepository>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { engine, repository, audit }
    }

    /// Read-check-write; the check is the single-successor rule and
    /// the write appends to the immutable transition log.
    pub async fn transition(
        &self,
        identity: IdentityId,
        target: LifecycleState,
        trigger: &str,
        correlation_id: &str,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let current = self
            .repository
            .current_state(&identity)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        let context = AuditContext::new(None, None, correlation_id, "lifecycle-api");
        let outcome = self
            .engine
            .apply_with_audit(&identity, current, target, trigger, &self.audit, &context)
            .map_err(DomainError::from)?;

        self.repository
            .save_state(&identity, outcome.to)
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;
        self.repository
            .append_transition(outcome.record.clone())
            .await
            .map_err(|error| ApplicationError::Persistence(error.to_string()))?;

        Ok(outcome)
    }
}

/// Interface-layer error with its HTTP rendering.
pub struct ApiError(InterfaceError);

impl From<InterfaceError> for ApiError {
    fn from(error: InterfaceError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, detail, correlation_id) = match &self.0 {
            InterfaceError::BadRequest { message, correlation_id } => {
                (StatusCode::BAD_REQUEST, message, correlation_id)
            }
            InterfaceError::Unprocessable { message, correlation_id } => {
                (StatusCode::UNPROCESSABLE_ENTITY, message, correlation_id)
            }
            InterfaceError::ServiceUnavailable { message, correlation_id } => {
                (StatusCode::SERVICE_UNAVAILABLE, message, correlation_id)
            }
            InterfaceError::Internal { message, correlation_id } => {
                (StatusCode::INTERNAL_SERVER_ERROR, message, correlation_id)
            }
        };

        let body = serde_json::json!({
            "error": self.0.user_message(),
            "detail": detail,
            "correlationId": correlation_id,
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ChatTurnBody {
    session_id: String,
    user_input: String,
    action: Option<String>,
    action_data: serde_json::Value,
    file_data: Option<String>,
    file_name: Option<String>,
    surface: Option<String>,
    identity: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CardBody {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatTurnReply {
    message: String,
    cards: Vec<CardBody>,
    prompt_chips: Vec<String>,
    conversation_state: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    platform_redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    selected_tenant_id: Option<String>,
}

impl From<TurnResponse> for ChatTurnReply {
    fn from(response: TurnResponse) -> Self {
        Self {
            message: response.message,
            cards: response
                .cards
                .into_iter()
                .map(|card| CardBody { kind: card.kind, email: card.email })
                .collect(),
            prompt_chips: response.prompt_chips,
            conversation_state: response.conversation_state,
            auth_token: response.auth_token,
            platform_redirect: response.platform_redirect,
            selected_tenant_id: response.selected_tenant_id,
        }
    }
}

async fn chat_turn(
    State(state): State<AppState>,
    Json(body): Json<ChatTurnBody>,
) -> Result<Json<ChatTurnReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();
    let request = TurnRequest {
        session_id: body.session_id,
        user_input: body.user_input,
        action: body.action,
        action_data: body.action_data,
        file_data: body.file_data,
        file_name: body.file_name,
        surface: body.surface,
        identity: body.identity,
    };

    let response = state
        .runtime
        .handle_turn(request)
        .await
        .map_err(|error| ApiError(error.into_interface(correlation_id)))?;
    Ok(Json(response.into()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TransitionBody {
    id: String,
    target_state: String,
    #[serde(default)]
    trigger: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TransitionReply {
    previous_state: String,
    new_state: String,
}

async fn lifecycle_transition(
    State(state): State<AppState>,
    Json(body): Json<TransitionBody>,
) -> Result<Json<TransitionReply>, ApiError> {
    let correlation_id = Uuid::new_v4().to_string();

    if body.id.trim().is_empty() {
        return Err(ApiError(InterfaceError::BadRequest {
            message: "id must not be empty".to_owned(),
            correlation_id,
        }));
    }
    let Some(target) = LifecycleState::parse(&body.target_state) else {
        return Err(ApiError(InterfaceError::BadRequest {
            message: format!("unknown targetState `{}`", body.target_state),
            correlation_id,
        }));
    };

    let outcome = state
        .lifecycle
        .transition(
            IdentityId(body.id),
            target,
            body.trigger.as_deref().unwrap_or("api"),
            &correlation_id,
        )
        .await
        .map_err(|error| ApiError(error.into_interface(correlation_id)))?;

    Ok(Json(TransitionReply {
        previous_state: outcome.from.as_str().to_owned(),
        new_state: outcome.to.as_str().to_owned(),
    }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisBody {
    payload: serde_json::Value,
    #[serde(default)]
    ruleset_id: Option<String>,
    #[serde(default)]
    profile: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalysisReply {
    passed: bool,
    ruleset_id: String,
    ruleset_version: u32,
    violations: Vec<ViolationBody>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ViolationBody {
    rule_id: String,
    message: String,
}

impl From<Violation> for ViolationBody {
    fn from(violation: Violation) -> Self {
        Self { rule_id: violation.rule_id, message: violation.message }
    }
}

/// Fail-closed: a gate-internal error blocks the payload with a 502
/// rather than letting unverified analysis through.
async fn analysis_validate(
    State(state): State<AppState>,
    Json(body): Json<AnalysisBody>,
) -> Result<Json<AnalysisReply>, Response> {
    let correlation_id = Uuid::new_v4().to_string();
    let profile = match body.profile.as_deref() {
        None | Some("financial") => AnalysisProfile::financial(),
        Some(other) => {
            return Err(ApiError(InterfaceError::BadRequest {
                message: format!("unknown analysis profile `{other}`"),
                correlation_id,
            })
            .into_response());
        }
    };

    let ruleset_id = body.ruleset_id.as_deref().unwrap_or_else(|| state.gate.ruleset_id());
    let result = state
        .gate
        .enforce_analysis(GatePolicy::FailClosed, ruleset_id, &body.payload, &profile)
        .map_err(|error| {
            warn!(
                event_name = "analysis.gate_error",
                error = %error,
                correlation_id = %correlation_id,
                "enforcement gate failed, blocking payload"
            );
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": "Analysis validation is unavailable.",
                    "correlationId": correlation_id,
                })),
            )
                .into_response()
        })?;

    let reply = AnalysisReply {
        passed: result.passed,
        ruleset_id: result.ruleset_id,
        ruleset_version: result.ruleset_version,
        violations: result.violations.into_iter().map(ViolationBody::from).collect(),
    };

    if !reply.passed {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, Json(reply)).into_response());
    }
    Ok(Json(reply))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use parley_agent::effects::{RecordingHub, SideEffectExecutor};
    use parley_agent::gate::EnforcementGate;
    use parley_agent::llm::ScriptedLlmClient;
    use parley_agent::runtime::TurnRuntime;
    use parley_core::audit::{AuditSink, InMemoryAuditSink};
    use parley_core::lifecycle::{LifecycleEngine, LifecycleState};
    use parley_core::session::IdentityId;
    use parley_db::repositories::{
        InMemoryLifecycleRepository, InMemorySessionRepository, LifecycleRepository,
    };
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::{router, AppState, LifecycleService};

    const DISCLAIMER: &str =
        "This reply is informational only and is not financial, legal, or tax advice.";

    fn state_with(
        llm: ScriptedLlmClient,
        lifecycle_repository: Arc<InMemoryLifecycleRepository>,
    ) -> AppState {
        state_with_sessions(Arc::new(InMemorySessionRepository::new()), llm, lifecycle_repository)
    }

    fn state_with_sessions(
        sessions: Arc<InMemorySessionRepository>,
        llm: ScriptedLlmClient,
        lifecycle_repository: Arc<InMemoryLifecycleRepository>,
    ) -> AppState {
        let hub = Arc::new(RecordingHub::default());
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
        let executor = Arc::new(SideEffectExecutor::new(
            hub.clone(),
            hub.clone(),
            hub.clone(),
            hub.clone(),
            hub.clone(),
            hub.clone(),
            audit.clone(),
        ));
        let runtime = Arc::new(TurnRuntime::new(
            sessions,
            Arc::new(llm),
            EnforcementGate::for_ruleset("conversation-baseline", DISCLAIMER).expect("gate"),
            executor,
            hub.clone(),
            hub,
            audit.clone(),
        ));

        AppState {
            runtime,
            gate: Arc::new(
                EnforcementGate::for_ruleset("conversation-baseline", DISCLAIMER).expect("gate"),
            ),
            lifecycle: Arc::new(LifecycleService::new(
                LifecycleEngine::new(),
                lifecycle_repository,
                audit,
            )),
        }
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request")
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn chat_turn_returns_camel_case_fields() {
        let state = state_with(
            ScriptedLlmClient::new(["Tell me more about your portfolio."]),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/chat/turn",
                json!({"sessionId": "sess-1", "userInput": "I manage 40 rental units in Austin"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Tell me more about your portfolio.");
        assert_eq!(body["conversationState"], "discovery");
        assert!(body["promptChips"].is_array());
        assert!(body.get("authToken").is_none());
    }

    #[tokio::test]
    async fn chat_turn_with_provider_outage_is_not_a_5xx() {
        let state = state_with(
            ScriptedLlmClient::failing(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/chat/turn",
                json!({"sessionId": "sess-1", "userInput": "hello"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn chat_turn_with_a_store_outage_is_not_a_5xx() {
        let sessions = Arc::new(InMemorySessionRepository::new());
        sessions.set_unavailable(true);
        let state = state_with_sessions(
            sessions,
            ScriptedLlmClient::default(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/chat/turn",
                json!({"sessionId": "sess-1", "userInput": "hello"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(!body["message"].as_str().expect("message").is_empty());
    }

    #[tokio::test]
    async fn chat_turn_without_a_session_id_is_a_400() {
        let state = state_with(
            ScriptedLlmClient::default(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json("/api/v1/chat/turn", json!({"userInput": "hello"})))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lifecycle_transition_applies_the_successor() {
        let repository = Arc::new(InMemoryLifecycleRepository::new());
        let state = state_with(ScriptedLlmClient::default(), repository.clone());

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/lifecycle/transition",
                json!({"id": "inv-1", "targetState": "prospect", "trigger": "intake"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["previousState"], "visitor");
        assert_eq!(body["newState"], "prospect");

        let log = repository
            .list_transitions(&IdentityId("inv-1".to_owned()))
            .await
            .expect("log");
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].trigger, "intake");
    }

    #[tokio::test]
    async fn skipping_a_lifecycle_state_is_a_422_naming_the_pair() {
        let repository = Arc::new(InMemoryLifecycleRepository::new());
        repository
            .save_state(&IdentityId("inv-2".to_owned()), LifecycleState::Verified)
            .await
            .expect("seed");
        let state = state_with(ScriptedLlmClient::default(), repository);

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/lifecycle/transition",
                json!({"id": "inv-2", "targetState": "shareholder"}),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        let detail = body["detail"].as_str().expect("detail");
        assert!(detail.contains("Verified"));
        assert!(detail.contains("Shareholder"));
    }

    #[tokio::test]
    async fn analysis_validation_fails_closed_on_a_hard_violation() {
        let state = state_with(
            ScriptedLlmClient::default(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/analysis/validate",
                json!({
                    "payload": {
                        "assumptions": ["stable rates"],
                        "methodology": "a risk-free investment model",
                    }
                }),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["passed"], false);
        assert!(!body["violations"].as_array().expect("violations").is_empty());
    }

    #[tokio::test]
    async fn analysis_with_an_unknown_ruleset_is_a_502() {
        let state = state_with(
            ScriptedLlmClient::default(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/analysis/validate",
                json!({
                    "rulesetId": "no-such-ruleset",
                    "payload": {
                        "assumptions": ["92% occupancy"],
                        "methodology": "discounted cash flow",
                    }
                }),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn clean_analysis_payload_passes() {
        let state = state_with(
            ScriptedLlmClient::default(),
            Arc::new(InMemoryLifecycleRepository::new()),
        );

        let response = router(state)
            .oneshot(post_json(
                "/api/v1/analysis/validate",
                json!({
                    "payload": {
                        "assumptions": ["92% occupancy"],
                        "methodology": "discounted cash flow",
                    }
                }),
            ))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["passed"], true);
        assert_eq!(body["rulesetId"], "conversation-baseline");
    }
}
