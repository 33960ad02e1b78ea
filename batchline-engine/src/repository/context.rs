//! Execution Context Repository
//!
//! Key/value context entries scoped to one job execution. Values are stored
//! as tagged JSON so the closed set of value kinds survives the round trip.

use batchline_core::domain::context::{ContextValue, ExecutionContext};
use sqlx::SqlitePool;

use crate::error::Result;

/// Insert or replace a context entry
pub async fn put(
    pool: &SqlitePool,
    execution_id: i64,
    key: &str,
    value: &ContextValue,
) -> Result<()> {
    let rendered = serde_json::to_string(value)?;

    sqlx::query(
        r#"
        INSERT INTO execution_context (job_execution_id, context_key, context_value)
        VALUES (?1, ?2, ?3)
        ON CONFLICT (job_execution_id, context_key) DO UPDATE SET context_value = excluded.context_value
        "#,
    )
    .bind(execution_id)
    .bind(key)
    .bind(&rendered)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a single context entry
pub async fn get(pool: &SqlitePool, execution_id: i64, key: &str) -> Result<Option<ContextValue>> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        SELECT context_value
        FROM execution_context
        WHERE job_execution_id = ?1 AND context_key = ?2
        "#,
    )
    .bind(execution_id)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    match row {
        Some((rendered,)) => Ok(Some(serde_json::from_str(&rendered)?)),
        None => Ok(None),
    }
}

/// Load all context entries for an execution
pub async fn load(pool: &SqlitePool, execution_id: i64) -> Result<ExecutionContext> {
    let rows: Vec<(String, String)> = sqlx::query_as(
        r#"
        SELECT context_key, context_value
        FROM execution_context
        WHERE job_execution_id = ?1
        "#,
    )
    .bind(execution_id)
    .fetch_all(pool)
    .await?;

    let mut context = ExecutionContext::new();
    for (key, rendered) in rows {
        context.put(key, serde_json::from_str(&rendered)?);
    }
    Ok(context)
}
