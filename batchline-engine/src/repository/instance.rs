//! Job Instance Repository
//!
//! Handles all database operations related to job instances.

use batchline_core::domain::job::JobInstance;
use batchline_core::domain::parameters::JobParameters;
use sqlx::SqlitePool;

use crate::error::{BatchError, Result};

/// Find the instance for (name, parameters), creating it if absent
///
/// Instance identity is enforced by the unique index on
/// (job_name, identity_key); a lost race with a concurrent creator resolves
/// to the instance the winner created.
pub async fn find_or_create(
    pool: &SqlitePool,
    job_name: &str,
    parameters: &JobParameters,
) -> Result<JobInstance> {
    let identity_key = parameters.identity_key();

    if let Some(existing) = find_by_name_and_key(pool, job_name, &identity_key).await? {
        return Ok(existing);
    }

    let now = chrono::Utc::now();
    let parameters_json = serde_json::to_string(parameters)?;

    let insert = sqlx::query(
        r#"
        INSERT INTO job_instances (job_name, parameters, identity_key, created_at)
        VALUES (?1, ?2, ?3, ?4)
        "#,
    )
    .bind(job_name)
    .bind(&parameters_json)
    .bind(&identity_key)
    .bind(now)
    .execute(pool)
    .await;

    let result = match insert {
        Ok(result) => result,
        Err(e) => {
            if is_unique_violation(&e) {
                if let Some(existing) = find_by_name_and_key(pool, job_name, &identity_key).await? {
                    return Ok(existing);
                }
            }
            return Err(e.into());
        }
    };

    let id = result.last_insert_rowid();
    tracing::info!("Job instance created: {} for job '{}'", id, job_name);

    Ok(JobInstance {
        id,
        job_name: job_name.to_string(),
        parameters: parameters.clone(),
        created_at: now,
    })
}

/// Find an instance by ID
pub async fn find_by_id(pool: &SqlitePool, id: i64) -> Result<Option<JobInstance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT id, job_name, parameters, identity_key, created_at
        FROM job_instances
        WHERE id = ?1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    row.map(JobInstance::try_from).transpose()
}

/// Find an instance by job name and parameter identity key
pub async fn find_by_name_and_key(
    pool: &SqlitePool,
    job_name: &str,
    identity_key: &str,
) -> Result<Option<JobInstance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT id, job_name, parameters, identity_key, created_at
        FROM job_instances
        WHERE job_name = ?1 AND identity_key = ?2
        "#,
    )
    .bind(job_name)
    .bind(identity_key)
    .fetch_optional(pool)
    .await?;

    row.map(JobInstance::try_from).transpose()
}

/// Find the most recently created instance of a job
pub async fn find_last_by_name(pool: &SqlitePool, job_name: &str) -> Result<Option<JobInstance>> {
    let row = sqlx::query_as::<_, InstanceRow>(
        r#"
        SELECT id, job_name, parameters, identity_key, created_at
        FROM job_instances
        WHERE job_name = ?1
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .bind(job_name)
    .fetch_optional(pool)
    .await?;

    row.map(JobInstance::try_from).transpose()
}

// =============================================================================
// Helper Functions
// =============================================================================

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
struct InstanceRow {
    id: i64,
    job_name: String,
    parameters: String,
    #[allow(dead_code)]
    identity_key: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

impl TryFrom<InstanceRow> for JobInstance {
    type Error = BatchError;

    fn try_from(row: InstanceRow) -> Result<Self> {
        let parameters: JobParameters = serde_json::from_str(&row.parameters)?;
        Ok(JobInstance {
            id: row.id,
            job_name: row.job_name,
            parameters,
            created_at: row.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use batchline_core::domain::parameters::ParameterValue;

    async fn test_pool() -> SqlitePool {
        let pool = db::create_pool("sqlite::memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn test_find_or_create_is_idempotent_for_same_parameters() {
        let pool = test_pool().await;
        let params = JobParameters::new().with("run.id", ParameterValue::Integer(1));

        let a = find_or_create(&pool, "skip_job", &params).await.unwrap();
        let b = find_or_create(&pool, "skip_job", &params).await.unwrap();

        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_concurrent_find_or_create_resolves_to_one_instance() {
        let pool = test_pool().await;
        let params = JobParameters::new().with("run.id", ParameterValue::Integer(1));

        let (a, b) = tokio::join!(
            find_or_create(&pool, "race_job", &params),
            find_or_create(&pool, "race_job", &params)
        );

        // The loser of the insert race resolves to the winner's instance
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_different_parameters_create_distinct_instances() {
        let pool = test_pool().await;
        let p1 = JobParameters::new().with("run.id", ParameterValue::Integer(1));
        let p2 = JobParameters::new().with("run.id", ParameterValue::Integer(2));

        let a = find_or_create(&pool, "skip_job", &p1).await.unwrap();
        let b = find_or_create(&pool, "skip_job", &p2).await.unwrap();

        assert_ne!(a.id, b.id);

        let last = find_last_by_name(&pool, "skip_job").await.unwrap().unwrap();
        assert_eq!(last.id, b.id);
        assert_eq!(last.parameters.get_integer("run.id"), Some(2));
    }

    #[tokio::test]
    async fn test_parameters_survive_round_trip() {
        let pool = test_pool().await;
        let params = JobParameters::new()
            .with("run.id", ParameterValue::Integer(3))
            .with("input", ParameterValue::String("trades.csv".to_string()));

        let created = find_or_create(&pool, "skip_job", &params).await.unwrap();
        let loaded = find_by_id(&pool, created.id).await.unwrap().unwrap();

        assert_eq!(loaded.parameters, params);
        assert_eq!(loaded.job_name, "skip_job");
    }
}
