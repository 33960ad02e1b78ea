//! Job Execution Repository
//!
//! Handles all database operations related to job executions, including the
//! launch invariants: a new execution is created by a transactional insert
//! guarded by a partial unique index, so two concurrent launches of the same
//! instance cannot both succeed.

use batchline_core::domain::job::JobExecution;
use batchline_core::domain::status::BatchStatus;
use sqlx::SqlitePool;

use crate::error::{BatchError, Result};

/// Create a new execution for an instance, enforcing the launch invariants
///
/// Fails with `AlreadyRunning` when a non-terminal execution exists,
/// `InstanceAlreadyComplete` when the most recent execution completed, and
/// `RestartNotAllowed` when the prior execution failed or stopped but the
/// job is not restartable. On a valid restart the prior execution's context
/// is copied to the new execution so committed read positions survive.
pub async fn create(
    pool: &SqlitePool,
    instance_id: i64,
    restartable: bool,
) -> Result<JobExecution> {
    let mut tx = pool.begin().await?;

    let last = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, job_instance_id, status, created_at, started_at, completed_at
        FROM job_executions
        WHERE job_instance_id = ?1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(&mut *tx)
    .await?;

    let mut restart_from = None;
    if let Some(last) = &last {
        let status = parse_status(&last.status)?;
        if !status.is_terminal() {
            return Err(BatchError::AlreadyRunning { instance_id });
        }
        match status {
            BatchStatus::Completed => {
                return Err(BatchError::InstanceAlreadyComplete { instance_id });
            }
            BatchStatus::Failed | BatchStatus::Stopped => {
                if !restartable {
                    return Err(BatchError::RestartNotAllowed(format!(
                        "instance {} has a {} execution but the job is not restartable",
                        instance_id,
                        status.as_str()
                    )));
                }
                restart_from = Some(last.id);
            }
            _ => {}
        }
    }

    let now = chrono::Utc::now();
    let insert = sqlx::query(
        r#"
        INSERT INTO job_executions (job_instance_id, status, created_at)
        VALUES (?1, ?2, ?3)
        "#,
    )
    .bind(instance_id)
    .bind(BatchStatus::Starting.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await;

    // The partial unique index turns a lost race into a constraint violation
    let result = match insert {
        Ok(result) => result,
        Err(e) => {
            if is_unique_violation(&e) {
                return Err(BatchError::AlreadyRunning { instance_id });
            }
            return Err(e.into());
        }
    };
    let id = result.last_insert_rowid();

    if let Some(prior_execution_id) = restart_from {
        sqlx::query(
            r#"
            INSERT INTO execution_context (job_execution_id, context_key, context_value)
            SELECT ?1, context_key, context_value
            FROM execution_context
            WHERE job_execution_id = ?2
            "#,
        )
        .bind(id)
        .bind(prior_execution_id)
        .execute(&mut *tx)
        .await?;

        tracing::info!(
            "Execution {} created as restart of execution {} (instance {})",
            id,
            prior_execution_id,
            instance_id
        );
    } else {
        tracing::info!("Execution {} created for instance {}", id, instance_id);
    }

    tx.commit().await?;

    Ok(JobExecution {
        id,
        instance_id,
        status: BatchStatus::Starting,
        created_at: now,
        started_at: None,
        completed_at: None,
    })
}

/// Find an execution by ID
pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<JobExecution>> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, job_instance_id, status, created_at, started_at, completed_at
        FROM job_executions
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(JobExecution::try_from).transpose()
}

/// Find the most recent execution of an instance
pub async fn find_last_by_instance(
    pool: &SqlitePool,
    instance_id: i64,
) -> Result<Option<JobExecution>> {
    let row = sqlx::query_as::<_, ExecutionRow>(
        r#"
        SELECT id, job_instance_id, status, created_at, started_at, completed_at
        FROM job_executions
        WHERE job_instance_id = ?1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(instance_id)
    .fetch_optional(pool)
    .await?;

    row.map(JobExecution::try_from).transpose()
}

/// Mark an execution as started
pub async fn mark_started(pool: &SqlitePool, id: i64) -> Result<()> {
    let now = chrono::Utc::now();

    sqlx::query(
        r#"
        UPDATE job_executions
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

/// Mark an execution with its terminal status
pub async fn mark_completed(pool: &SqlitePool, id: i64, status: BatchStatus) -> Result<()> {
    let now = chrono::Utc::now();

    sqlx::query(
        r#"
        UPDATE job_executions
        SET status = ?1, completed_at = ?2
        WHERE id = ?3
        "#,
    )
    .bind(status.as_str())
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    Ok(())
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_status(s: &str) -> Result<BatchStatus> {
    BatchStatus::parse(s)
        .ok_or_else(|| BatchError::Flow(format!("unknown persisted status '{}'", s)))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    error
        .as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

// =============================================================================
// Database Row Types
// =============================================================================

#[derive(sqlx::FromRow)]
struct ExecutionRow {
    id: i64,
    job_instance_id: i64,
    status: String,
    created_at: chrono::DateTime<chrono::Utc>,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl TryFrom<ExecutionRow> for JobExecution {
    type Error = BatchError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let status = parse_status(&row.status)?;
        Ok(JobExecution {
            id: row.id,
            instance_id: row.job_instance_id,
            status,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::repository::{context_repository, instance_repository};
    use batchline_core::domain::context::ContextValue;
    use batchline_core::domain::parameters::{JobParameters, ParameterValue};

    async fn test_pool() -> SqlitePool {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    async fn instance(pool: &SqlitePool, run_id: i64) -> i64 {
        let params = JobParameters::new().with("run.id", ParameterValue::Integer(run_id));
        instance_repository::find_or_create(pool, "skip_job", &params)
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_second_launch_while_running_fails() {
        let pool = test_pool().await;
        let instance_id = instance(&pool, 1).await;

        let first = create(&pool, instance_id, true).await.unwrap();
        assert_eq!(first.status, BatchStatus::Starting);

        let err = create(&pool, instance_id, true).await.unwrap_err();
        assert!(matches!(err, BatchError::AlreadyRunning { .. }));

        mark_started(&pool, first.id).await.unwrap();
        let err = create(&pool, instance_id, true).await.unwrap_err();
        assert!(matches!(err, BatchError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn test_completed_instance_cannot_be_relaunched() {
        let pool = test_pool().await;
        let instance_id = instance(&pool, 1).await;

        let execution = create(&pool, instance_id, true).await.unwrap();
        mark_completed(&pool, execution.id, BatchStatus::Completed)
            .await
            .unwrap();

        let err = create(&pool, instance_id, true).await.unwrap_err();
        assert!(matches!(err, BatchError::InstanceAlreadyComplete { .. }));
    }

    #[tokio::test]
    async fn test_failed_execution_allows_restart_and_copies_context() {
        let pool = test_pool().await;
        let instance_id = instance(&pool, 1).await;

        let first = create(&pool, instance_id, true).await.unwrap();
        context_repository::put(
            &pool,
            first.id,
            "step1.read.position",
            &ContextValue::Integer(6),
        )
        .await
        .unwrap();
        mark_completed(&pool, first.id, BatchStatus::Failed)
            .await
            .unwrap();

        let second = create(&pool, instance_id, true).await.unwrap();
        assert_ne!(first.id, second.id);

        let position = context_repository::get(&pool, second.id, "step1.read.position")
            .await
            .unwrap();
        assert_eq!(position.and_then(|v| v.as_integer()), Some(6));
    }

    #[tokio::test]
    async fn test_non_restartable_job_rejects_restart() {
        let pool = test_pool().await;
        let instance_id = instance(&pool, 1).await;

        let first = create(&pool, instance_id, true).await.unwrap();
        mark_completed(&pool, first.id, BatchStatus::Failed)
            .await
            .unwrap();

        let err = create(&pool, instance_id, false).await.unwrap_err();
        assert!(matches!(err, BatchError::RestartNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_concurrent_launch_attempts_yield_one_execution() {
        let pool = test_pool().await;
        let instance_id = instance(&pool, 1).await;

        let (a, b) = tokio::join!(
            create(&pool, instance_id, true),
            create(&pool, instance_id, true)
        );

        let successes = [a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count();
        assert_eq!(successes, 1);
    }
}
