//! In-memory repository fakes for exercising the critical path in
//! tests without a SQLite pool.

use std::collections::HashMap;
use std::sync::Mutex;

use parley_core::lifecycle::{LifecycleState, TransitionRecord};
use parley_core::session::{IdentityId, Session, SessionId};

use super::{LifecycleRepository, RepositoryError, SessionRepository};
use crate::repositories::session::merge_into;

#[derive(Default)]
pub struct InMemorySessionRepository {
    sessions: Mutex<HashMap<String, Session>>,
    /// When set, every call fails as if the store were unreachable.
    unavailable: std::sync::atomic::AtomicBool,
}

impl InMemorySessionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), RepositoryError> {
        if self.unavailable.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(RepositoryError::Decode("session store unavailable".to_owned()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl SessionRepository for InMemorySessionRepository {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        self.check_available()?;
        Ok(self.sessions.lock().expect("lock").get(&id.0).cloned())
    }

    async fn load_most_recent_for(
        &self,
        identity: &IdentityId,
    ) -> Result<Option<Session>, RepositoryError> {
        self.check_available()?;
        let sessions = self.sessions.lock().expect("lock");
        Ok(sessions
            .values()
            .filter(|session| session.identity.as_ref() == Some(identity))
            .max_by_key(|session| session.updated_at)
            .cloned())
    }

    async fn save(&self, session: Session) -> Result<(), RepositoryError> {
        self.check_available()?;
        let mut sessions = self.sessions.lock().expect("lock");
        let merged = match sessions.get(&session.id.0) {
            Some(existing) => merge_into(existing.clone(), session),
            None => session,
        };
        sessions.insert(merged.id.0.clone(), merged);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryLifecycleRepository {
    states: Mutex<HashMap<String, LifecycleState>>,
    transitions: Mutex<Vec<TransitionRecord>>,
}

impl InMemoryLifecycleRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl LifecycleRepository for InMemoryLifecycleRepository {
    async fn current_state(
        &self,
        identity: &IdentityId,
    ) -> Result<LifecycleState, RepositoryError> {
        Ok(self
            .states
            .lock()
            .expect("lock")
            .get(&identity.0)
            .copied()
            .unwrap_or(LifecycleState::Visitor))
    }

    async fn save_state(
        &self,
        identity: &IdentityId,
        state: LifecycleState,
    ) -> Result<(), RepositoryError> {
        self.states.lock().expect("lock").insert(identity.0.clone(), state);
        Ok(())
    }

    async fn append_transition(&self, record: TransitionRecord) -> Result<(), RepositoryError> {
        self.transitions.lock().expect("lock").push(record);
        Ok(())
    }

    async fn list_transitions(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        Ok(self
            .transitions
            .lock()
            .expect("lock")
            .iter()
            .filter(|record| record.identity == *identity)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use parley_core::session::{IdentityId, Session, SessionId, Surface};

    use super::InMemorySessionRepository;
    use crate::repositories::SessionRepository;

    #[tokio::test]
    async fn unavailable_store_fails_instead_of_caching() {
        let repository = InMemorySessionRepository::new();
        repository.set_unavailable(true);

        let result = repository.load(&SessionId("sess".to_owned())).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn fake_merge_matches_sql_merge_semantics() {
        let repository = InMemorySessionRepository::new();
        let mut first = Session::new(SessionId("sess".to_owned()), Surface::Discovery);
        first.set_field("collectedName", serde_json::json!("Ada"));
        first.bind_identity(IdentityId("acct".to_owned()));
        repository.save(first).await.expect("save");

        let second = Session::new(SessionId("sess".to_owned()), Surface::Discovery);
        repository.save(second).await.expect("save");

        let loaded = repository
            .load(&SessionId("sess".to_owned()))
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.field_str("collectedName"), Some("Ada"));
        assert_eq!(loaded.identity, Some(IdentityId("acct".to_owned())));
    }
}
