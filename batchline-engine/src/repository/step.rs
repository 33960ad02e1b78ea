//! Step Execution Repository
//!
//! Handles all database operations related to step executions. The
//! chunk-commit write updates the step's counters and the committed read
//! position in one transaction; that write is the durability anchor for
//! restart.

use batchline_core::domain::context::ContextValue;
use batchline_core::domain::status::BatchStatus;
use batchline_core::domain::step::{ExitStatus, StepExecution};
use sqlx::SqlitePool;

use crate::error::{BatchError, Result};

/// Create a new step execution in STARTING state
pub async fn create(pool: &SqlitePool, execution_id: i64, step_name: &str) -> Result<StepExecution> {
    let result = sqlx::query(
        r#"
        INSERT INTO step_executions (job_execution_id, step_name, status)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(execution_id)
    .bind(step_name)
    .bind(BatchStatus::Starting.as_str())
    .execute(pool)
    .await?;

    let id = result.last_insert_rowid();
    tracing::debug!(
        "Step execution {} created for step '{}' (execution {})",
        id,
        step_name,
        execution_id
    );

    Ok(StepExecution {
        id,
        job_execution_id: execution_id,
        step_name: step_name.to_string(),
        status: BatchStatus::Starting,
        exit_status: None,
        read_count: 0,
        write_count: 0,
        skip_count: 0,
        commit_count: 0,
        started_at: None,
        completed_at: None,
    })
}

/// Mark a step execution as started
pub async fn mark_started(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now();

    sqlx::query(
        r#"
        UPDATE step_executions
        SET status = ?1, started_at = ?2
        WHERE id = ?3
        "#,
    )
    .bind(BatchStatus::Started.as_str())
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Persist one chunk commit
///
/// Updates the step counters and the committed read position atomically.
/// Step progress must survive a crash between chunks, so both writes go
/// through one transaction.
pub async fn commit_chunk(
    pool: &SqlitePool,
    step: &StepExecution,
    position_key: &str,
    position: u64,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE step_executions
        SET read_count = ?1, write_count = ?2, skip_count = ?3, commit_count = ?4
        WHERE id = ?5
        "#,
    )
    .bind(step.read_count as i64)
    .bind(step.write_count as i64)
    .bind(step.skip_count as i64)
    .bind(step.commit_count as i64)
    .bind(step.id)
    .execute(&mut *tx)
    .await?;

    let rendered = serde_json::to_string(&ContextValue::Integer(position as i64))?;
    sqlx::query(
        r#"
        INSERT INTO execution_context (job_execution_id, context_key, context_value)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (job_execution_id, context_key) DO UPDATE SET context_value = excluded.context_value
        "#,
    )
    .bind(step.job_execution_id)
    .bind(position_key)
    .bind(&rendered)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

/// Mark a step execution with its terminal status and exit status
pub async fn complete(
    pool: &SqlitePool,
    id: i64,
    status: BatchStatus,
    exit_status: ExitStatus,
) -> Result<()> {
    let now = chrono::Utc::now();

    sqlx::query(
        r#"
        UPDATE step_executions
        SET status = ?1, exit_status = ?2, completed_at = ?3
        WHERE id = ?4
        "#,
    )
    .bind(status.as_str())
    .bind(exit_status.as_code())
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Find a step's execution within one job execution
pub async fn find_by_execution_and_name(
    pool: &SqlitePool,
    execution_id: i64,
    step_name: &str,
) -> Result<Option<StepExecution>> {
    let row = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT id, job_execution_id, step_name, status, exit_status,
               read_count, write_count, skip_count, commit_count,
               started_at, completed_at
        FROM step_executions
        WHERE job_execution_id = ?1 AND step_name = ?2
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(execution_id)
    .bind(step_name)
    .fetch_optional(pool)
    .await?;

    row.map(StepExecution::try_from).transpose()
}

/// Find the most recent COMPLETED run of a step in any execution of the
/// instance that precedes the given execution
///
/// Used on restart to decide whether a step can be carried over instead of
/// re-run.
pub async fn find_completed_in_prior_execution(
    pool: &SqlitePool,
    instance_id: i64,
    current_execution_id: i64,
    step_name: &str,
) -> Result<Option<StepExecution>> {
    let row = sqlx::query_as::<_, StepRow>(
        r#"
        SELECT se.id, se.job_execution_id, se.step_name, se.status, se.exit_status,
               se.read_count, se.write_count, se.skip_count, se.commit_count,
               se.started_at, se.completed_at
        FROM step_executions se
        JOIN job_executions je ON se.job_execution_id = je.id
        WHERE je.job_instance_id = ?1
          AND je.id < ?2
          AND se.step_name = ?3
          AND se.status = 'COMPLETED'
        ORDER BY se.id DESC
        LIMIT 1
        "#,
    )
    .bind(instance_id)
    .bind(current_execution_id)
    .bind(step_name)
    .fetch_optional(pool)
    .await?;

    row.map(StepExecution::try_from).transpose()
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct StepRow {
    id: i64,
    job_execution_id: i64,
    step_name: String,
    status: String,
    exit_status: Option<String>,
    read_count: i64,
    write_count: i64,
    skip_count: i64,
    commit_count: i64,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<StepRow> for StepExecution {
    type Error = BatchError;

    fn try_from(row: StepRow) -> Result<Self> {
        let status = BatchStatus::parse(&row.status)
            .ok_or_else(|| BatchError::Flow(format!("unknown persisted status '{}'", row.status)))?;
        let exit_status = row.exit_status.as_deref().and_then(ExitStatus::parse);

        Ok(StepExecution {
            id: row.id,
            job_execution_id: row.job_execution_id,
            step_name: row.step_name,
            status,
            exit_status,
            read_count: row.read_count as u32,
            write_count: row.write_count as u32,
            skip_count: row.skip_count as u32,
            commit_count: row.commit_count as u32,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}
