//! Asynchronous directive execution against external collaborators.
//!
//! The executor runs after the turn response is already on the wire:
//! best-effort, in order, one failure logged and skipped, no retry.
//! Collaborators receive an idempotency key derived from the turn so a
//! re-delivered directive can be deduplicated on their side.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parley_core::audit::{AuditCategory, AuditEvent, AuditOutcome, AuditSink};
use parley_core::directive::{
    ConfigSavePayload, IrActionPayload, RecordCreatePayload, RuleUploadPayload, TenantClaimPayload,
};
use parley_core::session::{IdentityId, SessionId};
use parley_core::Directive;
use tracing::{info, warn};

/// Identity and correlation context resolved before spawning.
#[derive(Clone, Debug)]
pub struct EffectContext {
    pub session_id: SessionId,
    pub turn_id: String,
    pub correlation_id: String,
    pub identity: Option<IdentityId>,
}

/// Stable per-directive key: same session, turn, and position always
/// yield the same value.
pub fn idempotency_key(session_id: &SessionId, turn_id: &str, directive_index: usize) -> String {
    format!("{}:{}:{}", session_id.0, turn_id, directive_index)
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedAccount {
    pub identity: IdentityId,
    pub auth_token: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub slug: String,
    pub portal_url: String,
}

#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    async fn provision(
        &self,
        email: &str,
        name: &str,
        business_name: &str,
        idempotency_key: &str,
    ) -> Result<ProvisionedAccount>;
}

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<TenantRecord>>;
    async fn create(
        &self,
        claim: &TenantClaimPayload,
        idempotency_key: &str,
    ) -> Result<TenantRecord>;
}

#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn create_record(
        &self,
        payload: &RecordCreatePayload,
        idempotency_key: &str,
    ) -> Result<()>;
}

#[async_trait]
pub trait DocumentRenderer: Send + Sync {
    async fn render(
        &self,
        template: &str,
        context: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<String>;
}

#[async_trait]
pub trait IrGateway: Send + Sync {
    async fn apply_action(&self, payload: &IrActionPayload, idempotency_key: &str) -> Result<()>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn save_ruleset(&self, payload: &RuleUploadPayload, idempotency_key: &str) -> Result<()>;
    async fn save_worker_spec(
        &self,
        payload: &ConfigSavePayload,
        idempotency_key: &str,
    ) -> Result<()>;
}

pub struct SideEffectExecutor {
    provisioner: Arc<dyn AccountProvisioner>,
    tenants: Arc<dyn TenantDirectory>,
    records: Arc<dyn RecordSink>,
    documents: Arc<dyn DocumentRenderer>,
    ir: Arc<dyn IrGateway>,
    rules: Arc<dyn RuleStore>,
    audit: Arc<dyn AuditSink>,
}

impl SideEffectExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provisioner: Arc<dyn AccountProvisioner>,
        tenants: Arc<dyn TenantDirectory>,
        records: Arc<dyn RecordSink>,
        documents: Arc<dyn DocumentRenderer>,
        ir: Arc<dyn IrGateway>,
        rules: Arc<dyn RuleStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self { provisioner, tenants, records, documents, ir, rules, audit }
    }

    /// Detach execution from the request. The task owns its directives
    /// and context; request cancellation does not reach it.
    pub fn spawn(self: &Arc<Self>, directives: Vec<Directive>, context: EffectContext) {
        if directives.is_empty() {
            return;
        }
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.run(directives, context).await;
        });
    }

    pub async fn run(&self, directives: Vec<Directive>, context: EffectContext) {
        for (index, directive) in directives.iter().enumerate() {
            let key = idempotency_key(&context.session_id, &context.turn_id, index);
            let kind = directive.kind().as_str();

            if let Err(error) = directive.validate() {
                warn!(
                    event_name = "effects.directive_invalid",
                    directive_kind = kind,
                    idempotency_key = %key,
                    error = %error,
                    "skipping invalid directive"
                );
                self.audit(&context, kind, &key, AuditOutcome::Rejected);
                continue;
            }

            match self.apply(directive, &key).await {
                Ok(()) => {
                    info!(
                        event_name = "effects.directive_applied",
                        directive_kind = kind,
                        idempotency_key = %key,
                    );
                    self.audit(&context, kind, &key, AuditOutcome::Success);
                }
                Err(error) => {
                    warn!(
                        event_name = "effects.directive_failed",
                        directive_kind = kind,
                        idempotency_key = %key,
                        error = %error,
                        "collaborator call failed, continuing with remaining directives"
                    );
                    self.audit(&context, kind, &key, AuditOutcome::Failed);
                }
            }
        }
    }

    async fn apply(&self, directive: &Directive, key: &str) -> Result<()> {
        match directive {
            Directive::AccountSignup(payload) => {
                // Async signups never surface a token; the account just
                // exists the next time the visitor authenticates.
                self.provisioner
                    .provision(&payload.email, &payload.name, &payload.business_name, key)
                    .await?;
                Ok(())
            }
            Directive::TenantClaim(payload) => {
                let slug = payload.effective_slug();
                if let Some(existing) = self.tenants.find_by_slug(&slug).await? {
                    info!(
                        event_name = "effects.tenant_claim_existing",
                        tenant_id = %existing.tenant_id,
                        slug = %slug,
                    );
                    return Ok(());
                }
                self.tenants.create(payload, key).await?;
                Ok(())
            }
            Directive::RecordCreate(payload) => self.records.create_record(payload, key).await,
            Directive::DocumentGenerate(payload) => {
                self.documents.render(&payload.template, &payload.context, key).await?;
                Ok(())
            }
            Directive::IrAction(payload) => self.ir.apply_action(payload, key).await,
            Directive::RuleUpload(payload) => self.rules.save_ruleset(payload, key).await,
            Directive::ConfigSave(payload) => self.rules.save_worker_spec(payload, key).await,
        }
    }

    fn audit(&self, context: &EffectContext, kind: &str, key: &str, outcome: AuditOutcome) {
        self.audit.emit(
            AuditEvent::new(
                Some(context.session_id.clone()),
                Some(context.turn_id.clone()),
                context.correlation_id.clone(),
                format!("effects.{kind}"),
                AuditCategory::System,
                "side-effect-executor",
                outcome,
            )
            .with_metadata("idempotency_key", key),
        );
    }
}

/// Recording fake implementing every collaborator trait, with a
/// per-kind failure toggle.
#[derive(Default)]
pub struct RecordingHub {
    pub calls: std::sync::Mutex<Vec<(String, String)>>,
    pub known_tenants: std::sync::Mutex<Vec<TenantRecord>>,
    pub fail_records: std::sync::atomic::AtomicBool,
}

impl RecordingHub {
    fn record(&self, operation: &str, detail: impl Into<String>) {
        self.calls.lock().expect("lock").push((operation.to_string(), detail.into()));
    }

    pub fn operations(&self) -> Vec<String> {
        self.calls.lock().expect("lock").iter().map(|(operation, _)| operation.clone()).collect()
    }
}

#[async_trait]
impl AccountProvisioner for RecordingHub {
    async fn provision(
        &self,
        email: &str,
        _name: &str,
        _business_name: &str,
        idempotency_key: &str,
    ) -> Result<ProvisionedAccount> {
        self.record("provision", format!("{email} {idempotency_key}"));
        Ok(ProvisionedAccount {
            identity: IdentityId(format!("acct-{email}")),
            auth_token: format!("token-{email}"),
        })
    }
}

#[async_trait]
impl TenantDirectory for RecordingHub {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<TenantRecord>> {
        Ok(self
            .known_tenants
            .lock()
            .expect("lock")
            .iter()
            .find(|tenant| tenant.slug == slug)
            .cloned())
    }

    async fn create(
        &self,
        claim: &TenantClaimPayload,
        idempotency_key: &str,
    ) -> Result<TenantRecord> {
        let slug = claim.effective_slug();
        self.record("tenant_create", format!("{slug} {idempotency_key}"));
        let record = TenantRecord {
            tenant_id: format!("tenant-{slug}"),
            portal_url: format!("/portal/{slug}"),
            slug,
        };
        self.known_tenants.lock().expect("lock").push(record.clone());
        Ok(record)
    }
}

#[async_trait]
impl RecordSink for RecordingHub {
    async fn create_record(
        &self,
        payload: &RecordCreatePayload,
        idempotency_key: &str,
    ) -> Result<()> {
        if self.fail_records.load(std::sync::atomic::Ordering::SeqCst) {
            anyhow::bail!("record sink unavailable");
        }
        self.record("create_record", format!("{} {idempotency_key}", payload.record_type));
        Ok(())
    }
}

#[async_trait]
impl DocumentRenderer for RecordingHub {
    async fn render(
        &self,
        template: &str,
        _context: &serde_json::Value,
        idempotency_key: &str,
    ) -> Result<String> {
        self.record("render", format!("{template} {idempotency_key}"));
        Ok(format!("rendered {template}"))
    }
}

#[async_trait]
impl IrGateway for RecordingHub {
    async fn apply_action(&self, payload: &IrActionPayload, idempotency_key: &str) -> Result<()> {
        self.record("ir_action", format!("{} {idempotency_key}", payload.action));
        Ok(())
    }
}

#[async_trait]
impl RuleStore for RecordingHub {
    async fn save_ruleset(&self, payload: &RuleUploadPayload, idempotency_key: &str) -> Result<()> {
        self.record("save_ruleset", format!("{} {idempotency_key}", payload.ruleset_id));
        Ok(())
    }

    async fn save_worker_spec(
        &self,
        payload: &ConfigSavePayload,
        idempotency_key: &str,
    ) -> Result<()> {
        self.record("save_worker_spec", format!("{} {idempotency_key}", payload.worker_name));
        Ok(())
    }
}
