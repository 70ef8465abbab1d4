pub mod audit;
pub mod config;
pub mod directive;
pub mod enforcement;
pub mod errors;
pub mod lifecycle;
pub mod protocol;
pub mod routing;
pub mod session;

pub use audit::{AuditCategory, AuditContext, AuditEvent, AuditOutcome, AuditSink};
pub use directive::{Directive, DirectiveError, DirectiveKind};
pub use enforcement::{
    conversation_baseline, AnalysisProfile, EnforcementResult, GatePolicy, Rule, RuleSeverity,
    Ruleset, SoftWarning, Violation,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::{
    LifecycleEngine, LifecycleState, LifecycleTransitionError, TransitionOutcome, TransitionRecord,
};
pub use protocol::{InlineFlag, ParseFailure, ParsedDraft, TokenParser};
pub use routing::{SurfaceRouter, SurfaceTag};
pub use session::{HistoryEntry, HistoryRole, IdentityId, Session, SessionId, Step, Surface};
