use chrono::{DateTime, Utc};
use sqlx::PgExecutor;

/// One stored shard configuration document. History is append-only; the
/// highest row id is the live document.
#[allow(dead_code)]
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ShardConfigRow {
    pub id: i64,
    pub document: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

pub async fn latest(
    executor: impl PgExecutor<'_>,
) -> Result<Option<ShardConfigRow>, sqlx::Error> {
    sqlx::query_as(
        "SELECT id, document, created_by, created_at
         FROM shard_config ORDER BY id DESC LIMIT 1",
    )
    .fetch_optional(executor)
    .await
}

pub async fn insert(
    executor: impl PgExecutor<'_>,
    document: &str,
    created_by: &str,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO shard_config (document, created_by) VALUES ($1, $2) RETURNING id",
    )
    .bind(document)
    .bind(created_by)
    .fetch_one(executor)
    .await?;

    Ok(id)
}
