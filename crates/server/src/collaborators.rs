//! Built-in collaborator implementations.
//!
//! External providers (identity, CRM, investor-relations back office)
//! are not wired yet; these stand-ins keep the executor's contract
//! honest: identities are minted locally, tenants live in process
//! memory, and sinks without a backend log the call with its
//! idempotency key so a later replay can be reconciled.

use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use parley_agent::effects::{
    AccountProvisioner, IrGateway, ProvisionedAccount, RecordSink, RuleStore, TenantDirectory,
    TenantRecord,
};
use parley_core::audit::{AuditEvent, AuditSink};
use parley_core::directive::{
    ConfigSavePayload, IrActionPayload, RecordCreatePayload, RuleUploadPayload, TenantClaimPayload,
};
use parley_core::session::IdentityId;
use tracing::info;
use uuid::Uuid;

/// Mints identities and bearer tokens locally.
#[derive(Default)]
pub struct LocalAccountProvisioner;

#[async_trait]
impl AccountProvisioner for LocalAccountProvisioner {
    async fn provision(
        &self,
        email: &str,
        _name: &str,
        _business_name: &str,
        idempotency_key: &str,
    ) -> Result<ProvisionedAccount> {
        info!(
            event_name = "collaborators.account_provisioned",
            email = %email,
            idempotency_key = %idempotency_key,
        );
        Ok(ProvisionedAccount {
            identity: IdentityId(format!("acct-{}", Uuid::new_v4())),
            auth_token: Uuid::new_v4().to_string(),
        })
    }
}

#[derive(Default)]
pub struct InProcessTenantDirectory {
    tenants: Mutex<Vec<TenantRecord>>,
}

#[async_trait]
impl TenantDirectory for InProcessTenantDirectory {
    async fn find_by_slug(&self, slug: &str) -> Result<Option<TenantRecord>> {
        Ok(self.tenants.lock().expect("lock").iter().find(|tenant| tenant.slug == slug).cloned())
    }

    async fn create(
        &self,
        claim: &TenantClaimPayload,
        idempotency_key: &str,
    ) -> Result<TenantRecord> {
        let slug = claim.effective_slug();
        let record = TenantRecord {
            tenant_id: format!("tenant-{}", Uuid::new_v4()),
            portal_url: format!("/portal/{slug}"),
            slug,
        };
        info!(
            event_name = "collaborators.tenant_created",
            tenant_id = %record.tenant_id,
            slug = %record.slug,
            idempotency_key = %idempotency_key,
        );
        self.tenants.lock().expect("lock").push(record.clone());
        Ok(record)
    }
}

/// Sink for record-create, ir-action, rule-upload, and worker-spec
/// directives until their real backends exist. Every accepted call is
/// logged with its idempotency key.
#[derive(Default)]
pub struct LoggingDirectiveSink;

#[async_trait]
impl RecordSink for LoggingDirectiveSink {
    async fn create_record(
        &self,
        payload: &RecordCreatePayload,
        idempotency_key: &str,
    ) -> Result<()> {
        info!(
            event_name = "collaborators.record_created",
            record_type = %payload.record_type,
            idempotency_key = %idempotency_key,
        );
        Ok(())
    }
}

#[async_trait]
impl IrGateway for LoggingDirectiveSink {
    async fn apply_action(&self, payload: &IrActionPayload, idempotency_key: &str) -> Result<()> {
        info!(
            event_name = "collaborators.ir_action_forwarded",
            action = %payload.action,
            investor_id = %payload.investor_id,
            idempotency_key = %idempotency_key,
        );
        Ok(())
    }
}

#[async_trait]
impl RuleStore for LoggingDirectiveSink {
    async fn save_ruleset(&self, payload: &RuleUploadPayload, idempotency_key: &str) -> Result<()> {
        info!(
            event_name = "collaborators.ruleset_stored",
            ruleset_id = %payload.ruleset_id,
            idempotency_key = %idempotency_key,
        );
        Ok(())
    }

    async fn save_worker_spec(
        &self,
        payload: &ConfigSavePayload,
        idempotency_key: &str,
    ) -> Result<()> {
        info!(
            event_name = "collaborators.worker_spec_stored",
            worker_name = %payload.worker_name,
            idempotency_key = %idempotency_key,
        );
        Ok(())
    }
}

/// Audit sink that forwards every event into structured logging.
#[derive(Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: AuditEvent) {
        info!(
            event_name = %event.event_type,
            category = ?event.category,
            outcome = ?event.outcome,
            correlation_id = %event.correlation_id,
            session_id = event.session_id.as_ref().map(|id| id.0.as_str()).unwrap_or("unknown"),
            turn_id = event.turn_id.as_deref().unwrap_or("unknown"),
            actor = %event.actor,
            "audit event"
        );
    }
}
