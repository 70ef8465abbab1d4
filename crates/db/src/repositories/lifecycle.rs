use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::lifecycle::{LifecycleState, TransitionRecord};
use parley_core::session::IdentityId;

use super::{LifecycleRepository, RepositoryError};
use crate::DbPool;

pub struct SqlLifecycleRepository {
    pool: DbPool,
}

impl SqlLifecycleRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl LifecycleRepository for SqlLifecycleRepository {
    async fn current_state(
        &self,
        identity: &IdentityId,
    ) -> Result<LifecycleState, RepositoryError> {
        let row = sqlx::query("SELECT state FROM lifecycle_record WHERE identity_id = ?")
            .bind(&identity.0)
            .fetch_optional(&self.pool)
            .await?;

        // Records are created implicitly at the chain's entry state.
        let Some(row) = row else {
            return Ok(LifecycleState::Visitor);
        };
        let raw: String = row.try_get("state")?;
        LifecycleState::parse(&raw)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown lifecycle state `{raw}`")))
    }

    async fn save_state(
        &self,
        identity: &IdentityId,
        state: LifecycleState,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO lifecycle_record (identity_id, state, created_at, updated_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (identity_id) DO UPDATE SET
                state = excluded.state,
                updated_at = excluded.updated_at",
        )
        .bind(&identity.0)
        .bind(state.as_str())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_transition(&self, record: TransitionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO lifecycle_transition
                (record_id, identity_id, from_state, to_state, trigger, actor, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.record_id)
        .bind(&record.identity.0)
        .bind(record.from.as_str())
        .bind(record.to.as_str())
        .bind(&record.trigger)
        .bind(&record.actor)
        .bind(record.occurred_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_transitions(
        &self,
        identity: &IdentityId,
    ) -> Result<Vec<TransitionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT record_id, identity_id, from_state, to_state, trigger, actor, occurred_at
             FROM lifecycle_transition
             WHERE identity_id = ?
             ORDER BY occurred_at ASC",
        )
        .bind(&identity.0)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(record_from_row).collect()
    }
}

fn record_from_row(row: SqliteRow) -> Result<TransitionRecord, RepositoryError> {
    let from_raw: String = row.try_get("from_state")?;
    let to_raw: String = row.try_get("to_state")?;
    let occurred_raw: String = row.try_get("occurred_at")?;

    Ok(TransitionRecord {
        record_id: row.try_get("record_id")?,
        identity: IdentityId(row.try_get("identity_id")?),
        from: LifecycleState::parse(&from_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown lifecycle state `{from_raw}`"))
        })?,
        to: LifecycleState::parse(&to_raw).ok_or_else(|| {
            RepositoryError::Decode(format!("unknown lifecycle state `{to_raw}`"))
        })?,
        trigger: row.try_get("trigger")?,
        actor: row.try_get("actor")?,
        occurred_at: DateTime::parse_from_rfc3339(&occurred_raw)
            .map(|timestamp| timestamp.with_timezone(&Utc))
            .map_err(|error| {
                RepositoryError::Decode(format!("bad timestamp `{occurred_raw}`: {error}"))
            })?,
    })
}

#[cfg(test)]
mod tests {
    use parley_core::lifecycle::{LifecycleEngine, LifecycleState};
    use parley_core::session::IdentityId;

    use super::SqlLifecycleRepository;
    use crate::migrations::run_pending;
    use crate::repositories::LifecycleRepository;
    use crate::connect;

    async fn repository() -> SqlLifecycleRepository {
        let pool = connect("sqlite::memory:").await.expect("pool");
        run_pending(&pool).await.expect("migrations");
        SqlLifecycleRepository::new(pool)
    }

    #[tokio::test]
    async fn unknown_identity_starts_at_visitor() {
        let repository = repository().await;
        let state = repository
            .current_state(&IdentityId("inv-new".to_owned()))
            .await
            .expect("query");
        assert_eq!(state, LifecycleState::Visitor);
    }

    #[tokio::test]
    async fn transition_log_is_append_only_and_ordered() {
        let repository = repository().await;
        let engine = LifecycleEngine::new();
        let identity = IdentityId("inv-2".to_owned());

        let mut state = LifecycleState::Visitor;
        for target in [LifecycleState::Prospect, LifecycleState::Verified] {
            let outcome = engine
                .apply(&identity, state, target, "kyc", "ir-desk")
                .expect("valid transition");
            repository.save_state(&identity, outcome.to).await.expect("save state");
            repository.append_transition(outcome.record).await.expect("append");
            state = target;
        }

        assert_eq!(
            repository.current_state(&identity).await.expect("state"),
            LifecycleState::Verified
        );
        let log = repository.list_transitions(&identity).await.expect("log");
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].from, LifecycleState::Visitor);
        assert_eq!(log[1].to, LifecycleState::Verified);
    }
}
