use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
use crate::session::IdentityId;

/// An identity's access tier in the investor-relations gating chain.
/// Created implicitly at `Visitor`; only ever advanced, never deleted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Visitor,
    Prospect,
    Verified,
    Invested,
    Shareholder,
}

impl LifecycleState {
    /// The single designated successor in the forward-only chain, or
    /// `None` at the terminal state.
    pub fn successor(&self) -> Option<LifecycleState> {
        match self {
            Self::Visitor => Some(Self::Prospect),
            Self::Prospect => Some(Self::Verified),
            Self::Verified => Some(Self::Invested),
            Self::Invested => Some(Self::Shareholder),
            Self::Shareholder => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Visitor => "visitor",
            Self::Prospect => "prospect",
            Self::Verified => "verified",
            Self::Invested => "invested",
            Self::Shareholder => "shareholder",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "visitor" => Some(Self::Visitor),
            "prospect" => Some(Self::Prospect),
            "verified" => Some(Self::Verified),
            "invested" => Some(Self::Invested),
            "shareholder" => Some(Self::Shareholder),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LifecycleTransitionError {
    #[error("disallowed lifecycle transition {from:?} -> {to:?}; only successor of {from:?} is permitted")]
    DisallowedPair { from: LifecycleState, to: LifecycleState },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub record: TransitionRecord,
}

/// Immutable entry appended to the identity's write-only transition
/// log; the log is never edited or compacted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub record_id: String,
    pub identity: IdentityId,
    pub from: LifecycleState,
    pub to: LifecycleState,
    pub trigger: String,
    pub actor: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default)]
pub struct LifecycleEngine;

impl LifecycleEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn initial_state(&self) -> LifecycleState {
        LifecycleState::Visitor
    }

    /// Pure transition check: valid iff `target` equals the single
    /// designated successor of `current`. Re-requesting a completed
    /// transition is itself a disallowed pair, since a state is never
    /// its own successor.
    pub fn apply(
        &self,
        identity: &IdentityId,
        current: LifecycleState,
        target: LifecycleState,
        trigger: impl Into<String>,
        actor: impl Into<String>,
    ) -> Result<TransitionOutcome, LifecycleTransitionError> {
        if current.successor() != Some(target) {
            return Err(LifecycleTransitionError::DisallowedPair { from: current, to: target });
        }

        Ok(TransitionOutcome {
            from: current,
            to: target,
            record: TransitionRecord {
                record_id: Uuid::new_v4().to_string(),
                identity: identity.clone(),
                from: current,
                to: target,
                trigger: trigger.into(),
                actor: actor.into(),
                occurred_at: Utc::now(),
            },
        })
    }

    pub fn apply_with_audit<S>(
        &self,
        identity: &IdentityId,
        current: LifecycleState,
        target: LifecycleState,
        trigger: impl Into<String>,
        sink: &S,
        audit: &AuditContext,
    ) -> Result<TransitionOutcome, LifecycleTransitionError>
    where
        S: AuditSink,
    {
        let result = self.apply(identity, current, target, trigger, audit.actor.clone());
        match &result {
            Ok(outcome) => {
                sink.emit(
                    AuditEvent::new(
                        audit.session_id.clone(),
                        audit.turn_id.clone(),
                        audit.correlation_id.clone(),
                        "lifecycle.transition_applied",
                        AuditCategory::Lifecycle,
                        audit.actor.clone(),
                        AuditOutcome::Success,
                    )
                    .with_metadata("identity", identity.0.clone())
                    .with_metadata("from", outcome.from.as_str())
                    .with_metadata("to", outcome.to.as_str()),
                );
            }
            Err(error) => {
                sink.emit(
                    AuditEvent::new(
                        audit.session_id.clone(),
                        audit.turn_id.clone(),
                        audit.correlation_id.clone(),
                        "lifecycle.transition_rejected",
                        AuditCategory::Lifecycle,
                        audit.actor.clone(),
                        AuditOutcome::Rejected,
                    )
                    .with_metadata("identity", identity.0.clone())
                    .with_metadata("error", error.to_string()),
                );
            }
        }
        result
    }
}
