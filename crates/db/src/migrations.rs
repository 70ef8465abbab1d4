use sqlx::migrate::{MigrateError, Migrator};

use crate::DbPool;

pub static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

pub async fn run_pending(pool: &DbPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[cfg(test)]
mod tests {
    use super::run_pending;
    use crate::connect;

    #[tokio::test]
    async fn migrations_create_foundation_tables() {
        let pool = connect("sqlite::memory:").await.expect("in-memory pool");
        run_pending(&pool).await.expect("migrations apply cleanly");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master \
             WHERE type = 'table' \
             AND name IN ('session', 'lifecycle_record', 'lifecycle_transition')",
        )
        .fetch_one(&pool)
        .await
        .expect("schema query");
        assert_eq!(table_count, 3);
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let pool = connect("sqlite::memory:").await.expect("in-memory pool");
        run_pending(&pool).await.expect("first run");
        run_pending(&pool).await.expect("second run is a no-op");
    }
}
