use std::sync::Arc;

use parley_agent::effects::SideEffectExecutor;
use parley_agent::gate::{EnforcementGate, GateError};
use parley_agent::llm::{LlmError, OpenAiCompatClient};
use parley_agent::render::TeraDocumentRenderer;
use parley_agent::runtime::TurnRuntime;
use parley_core::audit::AuditSink;
use parley_core::config::{AppConfig, ConfigError, LoadOptions};
use parley_core::lifecycle::LifecycleEngine;
use parley_db::repositories::{SqlLifecycleRepository, SqlSessionRepository};
use parley_db::{connect_with_settings, migrations, DbPool};
use thiserror::Error;
use tracing::info;

use crate::collaborators::{
    InProcessTenantDirectory, LocalAccountProvisioner, LoggingDirectiveSink, TracingAuditSink,
};
use crate::routes::{AppState, LifecycleService};

pub struct Application {
    pub config: AppConfig,
    pub db_pool: DbPool,
    pub state: AppState,
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("database connection failed: {0}")]
    DatabaseConnect(#[source] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[source] sqlx::migrate::MigrateError),
    #[error("llm client setup failed: {0}")]
    Llm(#[from] LlmError),
    #[error("enforcement gate setup failed: {0}")]
    Enforcement(#[from] GateError),
    #[error("document renderer setup failed: {0}")]
    Renderer(#[source] anyhow::Error),
}

pub async fn bootstrap(options: LoadOptions) -> Result<Application, BootstrapError> {
    let config = AppConfig::load(options)?;
    bootstrap_with_config(config).await
}

pub async fn bootstrap_with_config(config: AppConfig) -> Result<Application, BootstrapError> {
    info!(
        event_name = "system.bootstrap.start",
        correlation_id = "bootstrap",
        "starting application bootstrap"
    );

    let db_pool = connect_with_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.timeout_secs,
    )
    .await
    .map_err(BootstrapError::DatabaseConnect)?;
    info!(
        event_name = "system.bootstrap.database_connected",
        correlation_id = "bootstrap",
        "database connection established"
    );

    migrations::run_pending(&db_pool).await.map_err(BootstrapError::Migration)?;
    info!(
        event_name = "system.bootstrap.migrations_applied",
        correlation_id = "bootstrap",
        "database migrations applied"
    );

    let sessions = Arc::new(SqlSessionRepository::new(db_pool.clone()));
    let lifecycle_repository = Arc::new(SqlLifecycleRepository::new(db_pool.clone()));
    let audit: Arc<dyn AuditSink> = Arc::new(TracingAuditSink);

    let llm = Arc::new(OpenAiCompatClient::from_config(&config.llm)?);
    let provisioner = Arc::new(LocalAccountProvisioner);
    let tenants = Arc::new(InProcessTenantDirectory::default());
    let directive_sink = Arc::new(LoggingDirectiveSink);
    let documents = Arc::new(
        TeraDocumentRenderer::with_builtin_templates().map_err(BootstrapError::Renderer)?,
    );

    let executor = Arc::new(SideEffectExecutor::new(
        provisioner.clone(),
        tenants.clone(),
        directive_sink.clone(),
        documents,
        directive_sink.clone(),
        directive_sink,
        audit.clone(),
    ));

    let chat_gate = EnforcementGate::for_ruleset(
        &config.enforcement.ruleset,
        &config.enforcement.disclaimer,
    )?;
    let analysis_gate = Arc::new(EnforcementGate::for_ruleset(
        &config.enforcement.ruleset,
        &config.enforcement.disclaimer,
    )?);

    let runtime = Arc::new(TurnRuntime::new(
        sessions,
        llm,
        chat_gate,
        executor,
        provisioner,
        tenants,
        audit.clone(),
    ));

    let state = AppState {
        runtime,
        gate: analysis_gate,
        lifecycle: Arc::new(LifecycleService::new(
            LifecycleEngine::new(),
            lifecycle_repository,
            audit,
        )),
    };

    Ok(Application { config, db_pool, state })
}

#[cfg(test)]
mod tests {
    use parley_core::config::{ConfigOverrides, LoadOptions};

    use crate::bootstrap::{bootstrap, BootstrapError};

    fn options(database_url: &str) -> LoadOptions {
        LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some(database_url.to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        }
    }

    #[tokio::test]
    async fn bootstrap_applies_migrations_and_wires_the_runtime() {
        let app = bootstrap(options("sqlite::memory:?cache=shared"))
            .await
            .expect("bootstrap should succeed against an in-memory database");

        let (table_count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' \
             AND name IN ('session', 'lifecycle_record', 'lifecycle_transition')",
        )
        .fetch_one(&app.db_pool)
        .await
        .expect("foundation tables present after bootstrap");
        assert_eq!(table_count, 3);

        app.db_pool.close().await;
    }

    #[tokio::test]
    async fn bootstrap_fails_fast_on_an_unknown_ruleset() {
        let result = bootstrap(LoadOptions {
            overrides: ConfigOverrides {
                database_url: Some("sqlite::memory:".to_string()),
                enforcement_ruleset: Some("not-a-ruleset".to_string()),
                ..ConfigOverrides::default()
            },
            ..LoadOptions::default()
        })
        .await;

        assert!(matches!(result, Err(BootstrapError::Enforcement(_))));
    }
}
