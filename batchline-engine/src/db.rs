//! Database pool and schema
//!
//! The execution repository persists to SQLite. The single-running-execution
//! invariant is enforced by a partial unique index so that creating an
//! execution is a transactional insert, never a check-then-act race.

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::time::Duration;

/// Creates the repository connection pool
///
/// A single connection is used: in-memory SQLite databases are scoped to one
/// connection, and serializing repository writes through it doubles as the
/// locking guarantee for the create-execution compare-and-create.
pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .connect(database_url)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // Create job instances table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_name TEXT NOT NULL,
            parameters TEXT NOT NULL,
            identity_key TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE (job_name, identity_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create job executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS job_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_instance_id INTEGER NOT NULL REFERENCES job_instances(id) ON DELETE CASCADE,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // At most one non-terminal execution per instance
    sqlx::query(
        r#"
        CREATE UNIQUE INDEX IF NOT EXISTS idx_job_executions_one_active
        ON job_executions(job_instance_id)
        WHERE status IN ('STARTING', 'STARTED')
        "#,
    )
    .execute(pool)
    .await?;

    // Create step executions table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS step_executions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            job_execution_id INTEGER NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
            step_name TEXT NOT NULL,
            status TEXT NOT NULL,
            exit_status TEXT,
            read_count INTEGER NOT NULL DEFAULT 0,
            write_count INTEGER NOT NULL DEFAULT 0,
            skip_count INTEGER NOT NULL DEFAULT 0,
            commit_count INTEGER NOT NULL DEFAULT 0,
            started_at TEXT,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create execution context table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS execution_context (
            job_execution_id INTEGER NOT NULL REFERENCES job_executions(id) ON DELETE CASCADE,
            context_key TEXT NOT NULL,
            context_value TEXT NOT NULL,
            PRIMARY KEY (job_execution_id, context_key)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Create indexes for common lookups
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_job_executions_instance ON job_executions(job_instance_id)",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_step_executions_execution ON step_executions(job_execution_id, step_name)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database migrations completed successfully");
    Ok(())
}
