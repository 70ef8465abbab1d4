use async_trait::async_trait;
use thiserror::Error;

use parley_core::lifecycle::{LifecycleState, TransitionRecord};
use parley_core::session::{IdentityId, Session, SessionId};

pub mod lifecycle;
pub mod memory;
pub mod session;

pub use lifecycle::SqlLifecycleRepository;
pub use memory::{InMemoryLifecycleRepository, InMemorySessionRepository};
pub use session::SqlSessionRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
}

/// Durable conversation state, keyed by session id, with a secondary
/// "most recent session for an identity" lookup used to resume when an
/// authenticated caller starts a fresh session id.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError>;

    async fn load_most_recent_for(
        &self,
        identity: &IdentityId,
    ) -> Result<Option<Session>, RepositoryError>;

    /// Upsert that merges surface-scoped fields and per-surface history
    /// into the stored document instead of replacing it. No locking;
    /// the last writer for a session wins.
    async fn save(&self, session: Session) -> Result<(), RepositoryError>;
}

/// Lifecycle tier per identity plus its append-only transition log.
#[async_trait]
pub trait LifecycleRepository: Send + Sync {
    /// Current state; identities are created implicitly at `Visitor`.
    async fn current_state(
        &self,
        identity: &IdentityId,
    ) -> Result<LifecycleState, RepositoryError>;

    async fn save_state(
        &self,
        identity: &IdentityId,
        state: LifecycleState,
    ) -> Result<(), RepositoryError>;

    async fn append_transition(
        &self,
        record: TransitionRecord,
    ) -> Result<(), RepositoryError>;

    async fn list_transitions(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError>;
}
