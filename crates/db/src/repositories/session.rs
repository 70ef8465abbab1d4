use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use parley_core::session::{HistoryEntry, IdentityId, Session, SessionId, Step, Surface};

use super::{RepositoryError, SessionRepository};
use crate::DbPool;

pub struct SqlSessionRepository {
    pool: DbPool,
}

impl SqlSessionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SessionRepository for SqlSessionRepository {
    async fn load(&self, id: &SessionId) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, surface, step, fields_json, history_json, identity_id,
                    created_at, updated_at
             FROM session
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn load_most_recent_for(
        &self,
        identity: &IdentityId,
    ) -> Result<Option<Session>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, surface, step, fields_json, history_json, identity_id,
                    created_at, updated_at
             FROM session
             WHERE identity_id = ?
             ORDER BY updated_at DESC
             LIMIT 1",
        )
        .bind(&identity.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(session_from_row).transpose()
    }

    async fn save(&self, session: Session) -> Result<(), RepositoryError> {
        // Read-merge-write, not transactional: concurrent saves on the
        // same session race and the last writer wins.
        let merged = match self.load(&session.id).await? {
            Some(existing) => merge_into(existing, session),
            None => session,
        };

        let fields_json = serde_json::to_string(&merged.fields)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;
        let history_json = serde_json::to_string(&merged.history)
            .map_err(|error| RepositoryError::Decode(error.to_string()))?;

        sqlx::query(
            "INSERT INTO session (id, surface, step, fields_json, history_json,
                                  identity_id, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                surface = excluded.surface,
                step = excluded.step,
                fields_json = excluded.fields_json,
                history_json = excluded.history_json,
                identity_id = excluded.identity_id,
                updated_at = excluded.updated_at",
        )
        .bind(&merged.id.0)
        .bind(merged.surface.as_str())
        .bind(merged.step.as_str())
        .bind(&fields_json)
        .bind(&history_json)
        .bind(merged.identity.as_ref().map(|identity| identity.0.as_str()))
        .bind(merged.created_at.to_rfc3339())
        .bind(merged.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Merge semantics: the incoming turn's surface/step/identity win, but
/// stored fields and history surfaces absent from the incoming session
/// are preserved rather than dropped.
pub(crate) fn merge_into(existing: Session, incoming: Session) -> Session {
    let mut merged = incoming;

    for (key, value) in existing.fields {
        merged.fields.entry(key).or_insert(value);
    }
    for (surface, entries) in existing.history {
        merged.history.entry(surface).or_insert(entries);
    }
    if merged.identity.is_none() {
        merged.identity = existing.identity;
    }
    merged.created_at = existing.created_at;
    merged
}

fn session_from_row(row: SqliteRow) -> Result<Session, RepositoryError> {
    let surface_raw: String = row.try_get("surface")?;
    let surface = Surface::parse(&surface_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown surface `{surface_raw}`")))?;

    let step_raw: String = row.try_get("step")?;
    let step = Step::parse(&step_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown step `{step_raw}`")))?;

    let fields_json: String = row.try_get("fields_json")?;
    let fields: BTreeMap<String, serde_json::Value> = serde_json::from_str(&fields_json)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    let history_json: String = row.try_get("history_json")?;
    let history: BTreeMap<String, Vec<HistoryEntry>> = serde_json::from_str(&history_json)
        .map_err(|error| RepositoryError::Decode(error.to_string()))?;

    Ok(Session {
        id: SessionId(row.try_get("id")?),
        surface,
        step,
        fields,
        history,
        identity: row
            .try_get::<Option<String>, _>("identity_id")?
            .map(IdentityId),
        created_at: parse_timestamp(row.try_get("created_at")?)?,
        updated_at: parse_timestamp(row.try_get("updated_at")?)?,
    })
}

fn parse_timestamp(raw: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|timestamp| timestamp.with_timezone(&Utc))
        .map_err(|error| RepositoryError::Decode(format!("bad timestamp `{raw}`: {error}")))
}

#[cfg(test)]
mod tests {
    use parley_core::session::{
        HistoryRole, IdentityId, Session, SessionId, Step, Surface,
    };

    use super::SqlSessionRepository;
    use crate::migrations::run_pending;
    use crate::repositories::SessionRepository;
    use crate::connect;

    async fn repository() -> SqlSessionRepository {
        let pool = connect("sqlite::memory:").await.expect("pool");
        run_pending(&pool).await.expect("migrations");
        SqlSessionRepository::new(pool)
    }

    #[tokio::test]
    async fn load_of_unknown_session_is_empty() {
        let repository = repository().await;
        let loaded = repository.load(&SessionId("missing".to_owned())).await.expect("query");
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn save_then_load_round_trips_surface_step_and_fields() {
        let repository = repository().await;
        let mut session = Session::new(SessionId("sess-1".to_owned()), Surface::Invest);
        session.set_field("investorEmail", serde_json::json!("a@b.com"));
        session.push_history(HistoryRole::User, "my email is a@b.com");

        repository.save(session.clone()).await.expect("save");
        let loaded = repository
            .load(&SessionId("sess-1".to_owned()))
            .await
            .expect("load")
            .expect("present");

        assert_eq!(loaded.surface, Surface::Invest);
        assert_eq!(loaded.step, Step::InvestDiscovery);
        assert_eq!(loaded.field_str("investorEmail"), Some("a@b.com"));
        assert_eq!(loaded.surface_history().len(), 1);
    }

    #[tokio::test]
    async fn save_merges_fields_instead_of_replacing_the_document() {
        let repository = repository().await;
        let mut first = Session::new(SessionId("sess-2".to_owned()), Surface::Discovery);
        first.set_field("collectedName", serde_json::json!("Ada"));
        repository.save(first.clone()).await.expect("first save");

        // A save built from a session snapshot that never saw
        // `collectedName` must not erase it.
        let mut second = Session::new(SessionId("sess-2".to_owned()), Surface::Discovery);
        second.set_field("businessVertical", serde_json::json!("real-estate"));
        repository.save(second).await.expect("second save");

        let loaded = repository
            .load(&SessionId("sess-2".to_owned()))
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.field_str("collectedName"), Some("Ada"));
        assert_eq!(loaded.field_str("businessVertical"), Some("real-estate"));
    }

    #[tokio::test]
    async fn most_recent_session_for_identity_is_the_latest_updated() {
        let repository = repository().await;
        let identity = IdentityId("acct-7".to_owned());

        let mut older = Session::new(SessionId("sess-old".to_owned()), Surface::Discovery);
        older.bind_identity(identity.clone());
        repository.save(older).await.expect("save older");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let mut newer = Session::new(SessionId("sess-new".to_owned()), Surface::Discovery);
        newer.bind_identity(identity.clone());
        repository.save(newer).await.expect("save newer");

        let resumed = repository
            .load_most_recent_for(&identity)
            .await
            .expect("query")
            .expect("present");
        assert_eq!(resumed.id, SessionId("sess-new".to_owned()));
    }

    #[tokio::test]
    async fn identity_binding_survives_a_save_without_identity() {
        let repository = repository().await;
        let mut bound = Session::new(SessionId("sess-3".to_owned()), Surface::Discovery);
        bound.bind_identity(IdentityId("acct-1".to_owned()));
        repository.save(bound).await.expect("save bound");

        let unbound = Session::new(SessionId("sess-3".to_owned()), Surface::Discovery);
        repository.save(unbound).await.expect("save unbound snapshot");

        let loaded = repository
            .load(&SessionId("sess-3".to_owned()))
            .await
            .expect("load")
            .expect("present");
        assert_eq!(loaded.identity, Some(IdentityId("acct-1".to_owned())));
    }
}
