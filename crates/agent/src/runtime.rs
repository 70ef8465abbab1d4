//! End-to-end orchestration of one conversational turn.
//!
//! The runtime owns the loop described in the crate docs: route,
//! resume, draft, parse, enforce, respond, then detach side effects.
//! Explicit UI actions (`signup`, `selectTenant`, `magicLink`) bypass
//! drafting entirely; they are the only place a collaborator is called
//! synchronously, and the only place an auth token can be minted
//! within the turn.

use std::sync::Arc;

use parley_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use parley_core::errors::{ApplicationError, DomainError};
use parley_core::routing::{SurfaceRouter, SurfaceTag};
use parley_core::session::{HistoryRole, IdentityId, Session, SessionId, Step, Surface};
use parley_core::{InlineFlag, TokenParser};
use parley_db::repositories::SessionRepository;
use tracing::{info, warn};
use uuid::Uuid;

use crate::discovery::DiscoveryExtractor;
use crate::effects::{
    idempotency_key, AccountProvisioner, EffectContext, SideEffectExecutor, TenantDirectory,
};
use crate::gate::EnforcementGate;
use crate::llm::LlmClient;
use crate::prompt::{Attachment, DialogueEngine};

#[derive(Clone, Debug, Default)]
pub struct TurnRequest {
    pub session_id: String,
    pub user_input: String,
    pub action: Option<String>,
    pub action_data: serde_json::Value,
    /// Pre-extracted text of an uploaded file, if any.
    pub file_data: Option<String>,
    pub file_name: Option<String>,
    pub surface: Option<String>,
    /// Authenticated identity asserted by the auth layer upstream.
    pub identity: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Card {
    pub kind: String,
    pub email: Option<String>,
}

impl Card {
    fn magic_link(email: impl Into<String>) -> Self {
        Self { kind: "magicLink".to_owned(), email: Some(email.into()) }
    }

    fn signup() -> Self {
        Self { kind: "signup".to_owned(), email: None }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnResponse {
    pub message: String,
    pub cards: Vec<Card>,
    pub prompt_chips: Vec<String>,
    pub conversation_state: String,
    pub auth_token: Option<String>,
    pub platform_redirect: Option<String>,
    pub selected_tenant_id: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum UiAction {
    Signup,
    SelectTenant,
    MagicLink,
}

impl UiAction {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "signup" => Some(Self::Signup),
            "selectTenant" => Some(Self::SelectTenant),
            "magicLink" => Some(Self::MagicLink),
            _ => None,
        }
    }
}

pub struct TurnRuntime {
    sessions: Arc<dyn SessionRepository>,
    llm: Arc<dyn LlmClient>,
    router: SurfaceRouter,
    parser: TokenParser,
    engine: DialogueEngine,
    extractor: DiscoveryExtractor,
    gate: EnforcementGate,
    executor: Arc<SideEffectExecutor>,
    provisioner: Arc<dyn AccountProvisioner>,
    tenants: Arc<dyn TenantDirectory>,
    audit: Arc<dyn AuditSink>,
}

impl TurnRuntime {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sessions: Arc<dyn SessionRepository>,
        llm: Arc<dyn LlmClient>,
        gate: EnforcementGate,
        executor: Arc<SideEffectExecutor>,
        provisioner: Arc<dyn AccountProvisioner>,
        tenants: Arc<dyn TenantDirectory>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            sessions,
            llm,
            router: SurfaceRouter::new(),
            parser: TokenParser::new(),
            engine: DialogueEngine::new(),
            extractor: DiscoveryExtractor::new(),
            gate,
            executor,
            provisioner,
            tenants,
            audit,
        }
    }

    pub async fn handle_turn(
        &self,
        request: TurnRequest,
    ) -> Result<TurnResponse, ApplicationError> {
        if request.session_id.trim().is_empty() {
            return Err(DomainError::InvariantViolation(
                "sessionId must not be empty".to_owned(),
            )
            .into());
        }

        let session_id = SessionId(request.session_id.clone());
        let turn_id = Uuid::new_v4().to_string();
        let correlation_id = Uuid::new_v4().to_string();

        self.audit.emit(AuditEvent::new(
            Some(session_id.clone()),
            Some(turn_id.clone()),
            correlation_id.clone(),
            "turn.received",
            AuditCategory::Ingress,
            "chat",
            AuditOutcome::Success,
        ));

        // Store unreachable is an upstream failure like a provider
        // outage: the chat path answers with the surface fallback
        // instead of a 5xx. Explicit UI actions need the store and
        // stay hard.
        let existing = match self.sessions.load(&session_id).await {
            Ok(existing) => existing,
            Err(error) => {
                warn!(
                    event_name = "session.load_failed",
                    session_id = %session_id.0,
                    error = %error,
                    "session store unreachable"
                );
                self.audit.emit(AuditEvent::new(
                    Some(session_id.clone()),
                    Some(turn_id.clone()),
                    correlation_id.clone(),
                    "session.load_failed",
                    AuditCategory::Persistence,
                    "session-store",
                    AuditOutcome::Failed,
                ));
                if request.action.is_some() {
                    return Err(ApplicationError::Persistence(error.to_string()));
                }
                return Ok(self.fallback_turn(&request));
            }
        };

        if let Some(action) = request.action.as_deref() {
            let Some(action) = UiAction::parse(action) else {
                return Err(DomainError::InvariantViolation(format!(
                    "unknown action `{action}`"
                ))
                .into());
            };
            return self
                .handle_action(action, &request, existing, session_id, &turn_id, &correlation_id)
                .await;
        }

        self.handle_free_text(&request, existing, session_id, turn_id, correlation_id).await
    }

    async fn handle_action(
        &self,
        action: UiAction,
        request: &TurnRequest,
        existing: Option<Session>,
        session_id: SessionId,
        turn_id: &str,
        correlation_id: &str,
    ) -> Result<TurnResponse, ApplicationError> {
        let mut session =
            existing.unwrap_or_else(|| Session::new(session_id.clone(), Surface::Discovery));

        let response = match action {
            UiAction::Signup => {
                let email = string_field(&request.action_data, "email")
                    .or_else(|| session.field_str("contactEmail").map(str::to_owned))
                    .or_else(|| session.field_str("investorEmail").map(str::to_owned))
                    .ok_or_else(|| {
                        DomainError::InvariantViolation("signup requires an email".to_owned())
                    })?;
                let name = string_field(&request.action_data, "name").unwrap_or_default();
                let business_name =
                    string_field(&request.action_data, "businessName").unwrap_or_default();

                let key = idempotency_key(&session_id, turn_id, 0);
                let account = self
                    .provisioner
                    .provision(&email, &name, &business_name, &key)
                    .await
                    .map_err(|error| ApplicationError::Integration(error.to_string()))?;

                session.bind_identity(account.identity);
                let authenticated = match session.surface {
                    Surface::Invest => Step::InvestAuthenticated,
                    Surface::Developer => Step::DevAuthenticated,
                    _ => Step::Authenticated,
                };
                if authenticated.owner() == session.surface {
                    session.advance_step(authenticated).map_err(DomainError::from)?;
                }

                info!(
                    event_name = "turn.signup_completed",
                    session_id = %session_id.0,
                    "account provisioned and bound"
                );

                TurnResponse {
                    message: "You're all set and signed in.".to_owned(),
                    cards: Vec::new(),
                    prompt_chips: self.engine.prompt_chips(&session),
                    conversation_state: session.step.as_str().to_owned(),
                    auth_token: Some(account.auth_token),
                    platform_redirect: None,
                    selected_tenant_id: None,
                }
            }
            UiAction::SelectTenant => {
                let tenant_id =
                    string_field(&request.action_data, "tenantId").ok_or_else(|| {
                        DomainError::InvariantViolation(
                            "selectTenant requires a tenantId".to_owned(),
                        )
                    })?;
                let slug = string_field(&request.action_data, "slug");
                let portal_url = match slug {
                    Some(slug) => self
                        .tenants
                        .find_by_slug(&slug)
                        .await
                        .map_err(|error| ApplicationError::Integration(error.to_string()))?
                        .map(|tenant| tenant.portal_url),
                    None => None,
                };

                TurnResponse {
                    message: "Opening that workspace now.".to_owned(),
                    cards: Vec::new(),
                    prompt_chips: Vec::new(),
                    conversation_state: session.step.as_str().to_owned(),
                    auth_token: None,
                    platform_redirect: Some(
                        portal_url.unwrap_or_else(|| format!("/portal/{tenant_id}")),
                    ),
                    selected_tenant_id: Some(tenant_id),
                }
            }
            UiAction::MagicLink => {
                let email = string_field(&request.action_data, "email")
                    .or_else(|| session.field_str("investorEmail").map(str::to_owned))
                    .or_else(|| session.field_str("contactEmail").map(str::to_owned))
                    .ok_or_else(|| {
                        DomainError::InvariantViolation(
                            "magicLink requires an email on file".to_owned(),
                        )
                    })?;

                TurnResponse {
                    message: format!("Sent a fresh sign-in link to {email}."),
                    cards: vec![Card::magic_link(email)],
                    prompt_chips: self.engine.prompt_chips(&session),
                    conversation_state: session.step.as_str().to_owned(),
                    auth_token: None,
                    platform_redirect: None,
                    selected_tenant_id: None,
                }
            }
        };

        self.persist(session, turn_id, correlation_id).await;
        Ok(response)
    }

    async fn handle_free_text(
        &self,
        request: &TurnRequest,
        existing: Option<Session>,
        session_id: SessionId,
        turn_id: String,
        correlation_id: String,
    ) -> Result<TurnResponse, ApplicationError> {
        let tag = request.surface.as_deref().and_then(SurfaceTag::parse);

        // An authenticated caller on a fresh session id picks up their
        // most recent session instead of starting over, unless the turn
        // deep-links into a specialized surface.
        let existing = match (existing, request.identity.as_deref()) {
            (None, Some(identity))
                if !matches!(tag, Some(SurfaceTag::Invest | SurfaceTag::Developer)) =>
            {
                self.resume_for(identity, &session_id).await
            }
            (existing, _) => existing,
        };

        let surface = self.router.resolve(tag, existing.as_ref(), &request.user_input);

        let mut session =
            existing.unwrap_or_else(|| Session::new(session_id.clone(), surface));
        session.enter_surface(surface);

        let context = self.extractor.extract(&request.user_input);
        self.extractor.apply(&mut session, &context);

        let mut cards = Vec::new();
        let mut platform_redirect = None;

        // A fresh investor email short-circuits into verification: the
        // sign-in card goes out on this turn, not a later one.
        if session.surface == Surface::Invest && session.step == Step::InvestDiscovery {
            if let Some(email) = session.field_str("investorEmail").map(str::to_owned) {
                cards.push(Card::magic_link(email));
                session.advance_step(Step::InvestVerify).map_err(DomainError::from)?;
            }
        }

        let attachment = request.file_data.as_ref().map(|text| Attachment {
            file_name: request.file_name.clone().unwrap_or_else(|| "upload".to_owned()),
            text: text.clone(),
        });
        let plan = self.engine.plan(&session, &request.user_input, attachment.as_ref());

        let (message, directives, flags) =
            match self.llm.complete(&plan.instructions, &plan.messages).await {
                Ok(draft) => {
                    let parsed = self.parser.parse(&draft);
                    for failure in &parsed.failures {
                        warn!(
                            event_name = "protocol.span_stripped",
                            marker = failure.marker,
                            reason = %failure.reason,
                            "malformed directive span stripped from draft"
                        );
                    }
                    let gated = self.gate.enforce_chat(self.llm.as_ref(), &plan, parsed).await;
                    self.audit.emit(
                        AuditEvent::new(
                            Some(session_id.clone()),
                            Some(turn_id.clone()),
                            correlation_id.clone(),
                            "enforcement.evaluated",
                            AuditCategory::Enforcement,
                            "enforcement-gate",
                            if gated.result.passed {
                                AuditOutcome::Success
                            } else {
                                AuditOutcome::Rejected
                            },
                        )
                        .with_metadata("ruleset", gated.result.ruleset_id.clone())
                        .with_metadata(
                            "regenerations",
                            gated.result.regeneration_attempts.to_string(),
                        ),
                    );
                    (gated.visible_text, gated.directives, gated.flags)
                }
                Err(error) => {
                    warn!(
                        event_name = "dialogue.provider_failed",
                        error = %error,
                        "falling back to a static reply"
                    );
                    self.audit.emit(AuditEvent::new(
                        Some(session_id.clone()),
                        Some(turn_id.clone()),
                        correlation_id.clone(),
                        "dialogue.fallback_served",
                        AuditCategory::Dialogue,
                        "dialogue-engine",
                        AuditOutcome::Failed,
                    ));
                    (
                        self.engine.fallback_reply(session.surface).to_owned(),
                        Vec::new(),
                        Vec::new(),
                    )
                }
            };

        if flags.contains(&InlineFlag::ShowSignup) {
            cards.push(Card::signup());
        }
        if flags.contains(&InlineFlag::GoToDataroom) {
            platform_redirect = Some("/dataroom".to_owned());
        }

        session.push_history(HistoryRole::User, request.user_input.clone());
        session.push_history(HistoryRole::Assistant, message.clone());

        let response = TurnResponse {
            message,
            cards,
            prompt_chips: self.engine.prompt_chips(&session),
            conversation_state: session.step.as_str().to_owned(),
            auth_token: None,
            platform_redirect,
            selected_tenant_id: None,
        };

        let identity = session.identity.clone();
        self.persist(session, &turn_id, &correlation_id).await;

        self.executor.spawn(
            directives,
            EffectContext {
                session_id,
                turn_id,
                correlation_id,
                identity,
            },
        );

        Ok(response)
    }

    fn fallback_turn(&self, request: &TurnRequest) -> TurnResponse {
        let tag = request.surface.as_deref().and_then(SurfaceTag::parse);
        let surface = self.router.resolve(tag, None, &request.user_input);
        let session = Session::new(SessionId(request.session_id.clone()), surface);

        TurnResponse {
            message: self.engine.fallback_reply(surface).to_owned(),
            cards: Vec::new(),
            prompt_chips: self.engine.prompt_chips(&session),
            conversation_state: session.step.as_str().to_owned(),
            auth_token: None,
            platform_redirect: None,
            selected_tenant_id: None,
        }
    }

    /// A resume failure stays soft: the turn proceeds with a fresh
    /// session rather than failing.
    async fn resume_for(&self, identity: &str, session_id: &SessionId) -> Option<Session> {
        match self.sessions.load_most_recent_for(&IdentityId(identity.to_owned())).await {
            Ok(Some(prior)) => {
                info!(
                    event_name = "session.resumed",
                    session_id = %session_id.0,
                    resumed_from = %prior.id.0,
                    "resumed most recent session for authenticated identity"
                );
                Some(prior.resume_as(session_id.clone()))
            }
            Ok(None) => None,
            Err(error) => {
                warn!(
                    event_name = "session.resume_failed",
                    error = %error,
                    "starting a fresh session"
                );
                None
            }
        }
    }

    /// Chat stays soft on persistence failure: the reply already
    /// exists, so losing the save is logged and audited, not escalated.
    async fn persist(&self, session: Session, turn_id: &str, correlation_id: &str) {
        let session_id = session.id.clone();
        if let Err(error) = self.sessions.save(session).await {
            warn!(
                event_name = "session.save_failed",
                session_id = %session_id.0,
                error = %error,
                "turn response returned without a persisted session"
            );
            self.audit.emit(AuditEvent::new(
                Some(session_id),
                Some(turn_id.to_owned()),
                correlation_id.to_owned(),
                "session.save_failed",
                AuditCategory::Persistence,
                "session-store",
                AuditOutcome::Failed,
            ));
        }
    }
}

fn string_field(data: &serde_json::Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(serde_json::Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
}
