use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Oldest history entries are dropped first once a surface's history
/// reaches this length, so prompt size stays bounded.
pub const HISTORY_CAP: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityId(pub String);

/// A distinct persona/context the dialogue engine can operate under.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    Discovery,
    Invest,
    Developer,
    Sandbox,
    Privacy,
    Contact,
}

impl Surface {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Invest => "invest",
            Self::Developer => "developer",
            Self::Sandbox => "sandbox",
            Self::Privacy => "privacy",
            Self::Contact => "contact",
        }
    }

    pub fn is_default(&self) -> bool {
        matches!(self, Self::Discovery)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "discovery" => Some(Self::Discovery),
            "invest" => Some(Self::Invest),
            "developer" => Some(Self::Developer),
            "sandbox" => Some(Self::Sandbox),
            "privacy" => Some(Self::Privacy),
            "contact" => Some(Self::Contact),
            _ => None,
        }
    }
}

/// Surface-scoped dialogue progress marker. Step values are only
/// meaningful within their owning surface; storing a step under a
/// different surface is a defect the router must never produce.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    // Discovery surface
    Discovery,
    ConfirmIntent,
    Authenticated,
    // Invest surface
    InvestDiscovery,
    InvestVerify,
    InvestAuthenticated,
    // Developer surface
    DevDiscovery,
    DevSpec,
    DevAuthenticated,
    // Single-step surfaces
    SandboxActive,
    PrivacyIntake,
    ContactIntake,
}

impl Step {
    /// The surface that owns this step value.
    pub fn owner(&self) -> Surface {
        match self {
            Self::Discovery | Self::ConfirmIntent | Self::Authenticated => Surface::Discovery,
            Self::InvestDiscovery | Self::InvestVerify | Self::InvestAuthenticated => {
                Surface::Invest
            }
            Self::DevDiscovery | Self::DevSpec | Self::DevAuthenticated => Surface::Developer,
            Self::SandboxActive => Surface::Sandbox,
            Self::PrivacyIntake => Surface::Privacy,
            Self::ContactIntake => Surface::Contact,
        }
    }

    /// Entry step for a surface, used when a session first routes there.
    pub fn entry(surface: Surface) -> Self {
        match surface {
            Surface::Discovery => Self::Discovery,
            Surface::Invest => Self::InvestDiscovery,
            Surface::Developer => Self::DevDiscovery,
            Surface::Sandbox => Self::SandboxActive,
            Surface::Privacy => Self::PrivacyIntake,
            Surface::Contact => Self::ContactIntake,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::ConfirmIntent => "confirm_intent",
            Self::Authenticated => "authenticated",
            Self::InvestDiscovery => "invest_discovery",
            Self::InvestVerify => "invest_verify",
            Self::InvestAuthenticated => "invest_authenticated",
            Self::DevDiscovery => "dev_discovery",
            Self::DevSpec => "dev_spec",
            Self::DevAuthenticated => "dev_authenticated",
            Self::SandboxActive => "sandbox_active",
            Self::PrivacyIntake => "privacy_intake",
            Self::ContactIntake => "contact_intake",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "discovery" => Some(Self::Discovery),
            "confirm_intent" => Some(Self::ConfirmIntent),
            "authenticated" => Some(Self::Authenticated),
            "invest_discovery" => Some(Self::InvestDiscovery),
            "invest_verify" => Some(Self::InvestVerify),
            "invest_authenticated" => Some(Self::InvestAuthenticated),
            "dev_discovery" => Some(Self::DevDiscovery),
            "dev_spec" => Some(Self::DevSpec),
            "dev_authenticated" => Some(Self::DevAuthenticated),
            "sandbox_active" => Some(Self::SandboxActive),
            "privacy_intake" => Some(Self::PrivacyIntake),
            "contact_intake" => Some(Self::ContactIntake),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryRole {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
}

/// Durable per-conversation state. Exclusively owned by the
/// orchestration core; collaborators only ever see emitted directives.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub surface: Surface,
    pub step: Step,
    /// Surface-scoped collected fields (name, email, discovered
    /// business context, ...). Merged key-by-key on save.
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Per-surface message history, capped FIFO at [`HISTORY_CAP`].
    pub history: BTreeMap<String, Vec<HistoryEntry>>,
    /// Bound once authentication succeeds, never cleared.
    pub identity: Option<IdentityId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, surface: Surface) -> Self {
        let now = Utc::now();
        Self {
            id,
            surface,
            step: Step::entry(surface),
            fields: BTreeMap::new(),
            history: BTreeMap::new(),
            identity: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn surface_history(&self) -> &[HistoryEntry] {
        self.history.get(self.surface.as_str()).map(Vec::as_slice).unwrap_or_default()
    }

    /// Append an entry to the current surface's history, evicting the
    /// oldest entries past the cap. FIFO over an ordered sequence, not
    /// an LRU cache.
    pub fn push_history(&mut self, role: HistoryRole, text: impl Into<String>) {
        let entries = self.history.entry(self.surface.as_str().to_string()).or_default();
        entries.push(HistoryEntry { role, text: text.into() });
        if entries.len() > HISTORY_CAP {
            let overflow = entries.len() - HISTORY_CAP;
            entries.drain(..overflow);
        }
        self.updated_at = Utc::now();
    }

    pub fn set_field(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.fields.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(serde_json::Value::as_str)
    }

    /// Move this session to `surface`, resetting the step to the new
    /// surface's entry step unless the current step already belongs
    /// there.
    pub fn enter_surface(&mut self, surface: Surface) {
        if self.surface != surface || self.step.owner() != surface {
            self.surface = surface;
            self.step = Step::entry(surface);
        }
        self.updated_at = Utc::now();
    }

    /// Advance the step within the current surface. Steps belonging to
    /// another surface are rejected as a cross-surface leak.
    pub fn advance_step(&mut self, step: Step) -> Result<(), StepOwnershipError> {
        if step.owner() != self.surface {
            return Err(StepOwnershipError { step, surface: self.surface });
        }
        self.step = step;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn bind_identity(&mut self, identity: IdentityId) {
        // Set once; a later bind for the same session is ignored.
        if self.identity.is_none() {
            self.identity = Some(identity);
            self.updated_at = Utc::now();
        }
    }

    /// Carry this session's state forward under a fresh session id.
    /// Fields, history, identity, and step all survive; only the id
    /// changes, so later saves land on the new id.
    pub fn resume_as(mut self, id: SessionId) -> Self {
        self.id = id;
        self.updated_at = Utc::now();
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("step {step:?} belongs to surface {:?}, not {surface:?}", step.owner())]
pub struct StepOwnershipError {
    pub step: Step,
    pub surface: Surface,
}

#[cfg(test)]
mod tests {
    use super::{
        HistoryRole, IdentityId, Session, SessionId, Step, Surface, HISTORY_CAP,
    };

    fn session() -> Session {
        Session::new(SessionId("sess-1".to_owned()), Surface::Discovery)
    }

    #[test]
    fn every_step_is_owned_by_exactly_one_surface() {
        let steps = [
            Step::Discovery,
            Step::ConfirmIntent,
            Step::Authenticated,
            Step::InvestDiscovery,
            Step::InvestVerify,
            Step::InvestAuthenticated,
            Step::DevDiscovery,
            Step::DevSpec,
            Step::DevAuthenticated,
            Step::SandboxActive,
            Step::PrivacyIntake,
            Step::ContactIntake,
        ];
        for step in steps {
            let owner = step.owner();
            assert_eq!(Step::entry(owner).owner(), owner);
        }
    }

    #[test]
    fn history_cap_evicts_oldest_first() {
        let mut session = session();
        for index in 0..(HISTORY_CAP + 5) {
            session.push_history(HistoryRole::User, format!("turn {index}"));
        }

        let history = session.surface_history();
        assert_eq!(history.len(), HISTORY_CAP);
        assert_eq!(history[0].text, "turn 5");
        assert_eq!(history[HISTORY_CAP - 1].text, format!("turn {}", HISTORY_CAP + 4));
    }

    #[test]
    fn resume_carries_state_under_a_new_id() {
        let mut session = session();
        session.set_field("contactEmail", serde_json::json!("ada@example.com"));
        session.bind_identity(IdentityId("acct-1".to_owned()));
        session.push_history(HistoryRole::User, "hi");

        let resumed = session.resume_as(SessionId("sess-2".to_owned()));

        assert_eq!(resumed.id, SessionId("sess-2".to_owned()));
        assert_eq!(resumed.field_str("contactEmail"), Some("ada@example.com"));
        assert_eq!(resumed.identity, Some(IdentityId("acct-1".to_owned())));
        assert_eq!(resumed.surface_history().len(), 1);
    }

    #[test]
    fn cross_surface_step_is_rejected() {
        let mut session = session();
        let error = session.advance_step(Step::InvestVerify).expect_err("must reject leak");
        assert_eq!(error.step, Step::InvestVerify);
        assert_eq!(error.surface, Surface::Discovery);
        assert_eq!(session.step, Step::Discovery);
    }

    #[test]
    fn entering_a_surface_resets_to_its_entry_step() {
        let mut session = session();
        session.enter_surface(Surface::Invest);
        assert_eq!(session.surface, Surface::Invest);
        assert_eq!(session.step, Step::InvestDiscovery);

        session.advance_step(Step::InvestVerify).expect("step owned by invest");
        session.enter_surface(Surface::Invest);
        assert_eq!(session.step, Step::InvestVerify, "re-entry keeps in-surface progress");
    }

    #[test]
    fn identity_binds_once_and_never_rebinds() {
        let mut session = session();
        session.bind_identity(IdentityId("acct-1".to_owned()));
        session.bind_identity(IdentityId("acct-2".to_owned()));
        assert_eq!(session.identity, Some(IdentityId("acct-1".to_owned())));
    }

    #[test]
    fn histories_are_kept_per_surface() {
        let mut session = session();
        session.push_history(HistoryRole::User, "hello from discovery");
        session.enter_surface(Surface::Developer);
        session.push_history(HistoryRole::User, "hello from developer");

        assert_eq!(session.surface_history().len(), 1);
        assert_eq!(session.surface_history()[0].text, "hello from developer");
        assert_eq!(session.history.get("discovery").map(Vec::len), Some(1));
    }
}
