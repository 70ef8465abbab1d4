use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Structured action extracted from free-text model output, destined
/// for asynchronous execution. Payloads are transient: once executed
/// the directive is discarded, only the collaborator's outcome may be
/// durably recorded.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Directive {
    AccountSignup(AccountSignupPayload),
    TenantClaim(TenantClaimPayload),
    RecordCreate(RecordCreatePayload),
    DocumentGenerate(DocumentGeneratePayload),
    IrAction(IrActionPayload),
    RuleUpload(RuleUploadPayload),
    ConfigSave(ConfigSavePayload),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectiveKind {
    AccountSignup,
    TenantClaim,
    RecordCreate,
    DocumentGenerate,
    IrAction,
    RuleUpload,
    ConfigSave,
}

impl DirectiveKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AccountSignup => "account-signup",
            Self::TenantClaim => "tenant-claim",
            Self::RecordCreate => "record-create",
            Self::DocumentGenerate => "document-generate",
            Self::IrAction => "ir-action",
            Self::RuleUpload => "rule-upload",
            Self::ConfigSave => "config-save",
        }
    }
}

fn default_schema_version() -> u32 {
    1
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountSignupPayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub email: String,
    pub name: String,
    pub business_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantClaimPayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub tenant_name: String,
    pub slug: String,
    pub vertical: String,
}

impl TenantClaimPayload {
    /// Deterministic slug so a repeated claim targets the same record.
    pub fn effective_slug(&self) -> String {
        let source = if self.slug.trim().is_empty() { &self.tenant_name } else { &self.slug };
        source
            .trim()
            .to_ascii_lowercase()
            .chars()
            .map(|character| if character.is_ascii_alphanumeric() { character } else { '-' })
            .collect::<String>()
            .split('-')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>()
            .join("-")
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordCreatePayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub record_type: String,
    pub data: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentGeneratePayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub template: String,
    pub context: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IrActionPayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub action: String,
    pub investor_id: String,
    pub target_state: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUploadPayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub ruleset_id: String,
    pub rules: serde_json::Value,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigSavePayload {
    #[serde(rename = "schemaVersion", default = "default_schema_version")]
    pub schema_version: u32,
    pub worker_name: String,
    pub spec: serde_json::Value,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("directive {kind} missing required field `{field}`")]
    MissingField { kind: &'static str, field: &'static str },
}

impl Directive {
    pub fn kind(&self) -> DirectiveKind {
        match self {
            Self::AccountSignup(_) => DirectiveKind::AccountSignup,
            Self::TenantClaim(_) => DirectiveKind::TenantClaim,
            Self::RecordCreate(_) => DirectiveKind::RecordCreate,
            Self::DocumentGenerate(_) => DirectiveKind::DocumentGenerate,
            Self::IrAction(_) => DirectiveKind::IrAction,
            Self::RuleUpload(_) => DirectiveKind::RuleUpload,
            Self::ConfigSave(_) => DirectiveKind::ConfigSave,
        }
    }

    /// Minimal required-field check. Unknown and missing optional
    /// fields default rather than reject; only the one field each kind
    /// cannot act without is enforced.
    pub fn validate(&self) -> Result<(), DirectiveError> {
        let missing = |field| DirectiveError::MissingField { kind: self.kind().as_str(), field };
        match self {
            Self::AccountSignup(payload) if payload.email.trim().is_empty() => {
                Err(missing("email"))
            }
            Self::TenantClaim(payload) if payload.effective_slug().is_empty() => {
                Err(missing("tenant_name"))
            }
            Self::RecordCreate(payload) if payload.record_type.trim().is_empty() => {
                Err(missing("record_type"))
            }
            Self::DocumentGenerate(payload) if payload.template.trim().is_empty() => {
                Err(missing("template"))
            }
            Self::IrAction(payload) if payload.investor_id.trim().is_empty() => {
                Err(missing("investor_id"))
            }
            Self::RuleUpload(payload) if payload.ruleset_id.trim().is_empty() => {
                Err(missing("ruleset_id"))
            }
            Self::ConfigSave(payload) if payload.worker_name.trim().is_empty() => {
                Err(missing("worker_name"))
            }
            _ => Ok(()),
        }
    }
}
