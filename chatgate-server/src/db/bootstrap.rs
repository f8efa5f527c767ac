use sqlx::{PgPool, postgres::PgPoolOptions};
use thiserror::Error;
use tracing::{debug, info};

use shared::config::server::DatabaseConfig;

/// Ordered DDL applied at startup. Every statement is idempotent.
const SCHEMA_STEPS: &[(&str, &str)] = &[
    ("schema", "CREATE SCHEMA IF NOT EXISTS chatgate"),
    (
        "sessions",
        "CREATE TABLE IF NOT EXISTS chatgate.sessions (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            tenant_id TEXT,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )",
    ),
    (
        "messages",
        "CREATE TABLE IF NOT EXISTS chatgate.messages (
            id UUID PRIMARY KEY,
            session_id TEXT NOT NULL REFERENCES chatgate.sessions (id) ON DELETE CASCADE,
            role TEXT NOT NULL CHECK (role IN ('user', 'assistant')),
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL
        )",
    ),
    (
        "messages_session_idx",
        "CREATE INDEX IF NOT EXISTS messages_session_created_idx \
         ON chatgate.messages (session_id, created_at DESC)",
    ),
];

/// Failure while connecting to or preparing the database.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("database url is not configured")]
    MissingUrl,
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("database error applying step '{step}': {source}")]
    Sql {
        step: &'static str,
        #[source]
        source: sqlx::Error,
    },
}

/// Opens the connection pool described by `config`.
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool, BootstrapError> {
    let url = config.url.as_deref().ok_or(BootstrapError::MissingUrl)?;
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(url)
        .await
        .map_err(BootstrapError::Connect)
}

/// Applies the chat schema.
pub async fn run(pool: &PgPool) -> Result<(), BootstrapError> {
    info!(steps = SCHEMA_STEPS.len(), "running database bootstrap");
    for &(step, sql) in SCHEMA_STEPS {
        debug!(step, "applying bootstrap step");
        sqlx::query(sql)
            .execute(pool)
            .await
            .map_err(|source| BootstrapError::Sql { step, source })?;
    }
    Ok(())
}

/// Simple liveness check used during startup and by readiness probes.
pub async fn ensure_liveness(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await.map(|_| ())
}
