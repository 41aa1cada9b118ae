use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor};
use std::str::FromStr;

use crate::models::{ApiKeyRecord, ApiKeyStatus, KeyLimits};

const COLUMNS: &str =
    "id, api_key, description, status, pricing_plan_id, active_until, created_at";

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: i64,
    api_key: String,
    description: Option<String>,
    status: String,
    pricing_plan_id: Option<i64>,
    active_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl TryFrom<ApiKeyRow> for ApiKeyRecord {
    type Error = sqlx::Error;

    fn try_from(row: ApiKeyRow) -> Result<Self, Self::Error> {
        let status = ApiKeyStatus::from_str(&row.status)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(ApiKeyRecord {
            id: row.id,
            api_key: row.api_key,
            description: row.description,
            status,
            pricing_plan_id: row.pricing_plan_id,
            active_until: row.active_until,
            created_at: row.created_at,
        })
    }
}

pub async fn find_by_key(
    executor: impl PgExecutor<'_>,
    api_key: &str,
) -> Result<Option<ApiKeyRecord>, sqlx::Error> {
    let row: Option<ApiKeyRow> = sqlx::query_as(&format!(
        "SELECT {} FROM api_keys WHERE api_key = $1",
        COLUMNS
    ))
    .bind(api_key)
    .fetch_optional(executor)
    .await?;

    row.map(ApiKeyRecord::try_from).transpose()
}

/// Request budget for an effective key, joined from its plan. Returns None
/// when the key is unknown, revoked, planless, or past its window.
pub async fn find_limits_if_effective(
    executor: impl PgExecutor<'_>,
    api_key: &str,
    now: DateTime<Utc>,
) -> Result<Option<KeyLimits>, sqlx::Error> {
    let row: Option<(i32, i32)> = sqlx::query_as(
        r#"
        SELECT p.requests_per_second, p.requests_per_day
        FROM api_keys k
        JOIN pricing_plans p ON p.id = k.pricing_plan_id
        WHERE k.api_key = $1
          AND k.status = 'active'
          AND k.active_until > $2
        "#,
    )
    .bind(api_key)
    .bind(now)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(|(rps, rpd)| KeyLimits {
        requests_per_second: rps.max(0) as u32,
        requests_per_day: rpd.max(0) as u32,
    }))
}

/// Exclusive row lock, failing fast on contention (`NOWAIT`). Callers must
/// take this lock before any payment_sessions lock.
pub async fn lock_for_update(
    conn: &mut PgConnection,
    api_key: &str,
) -> Result<Option<ApiKeyRecord>, sqlx::Error> {
    let row: Option<ApiKeyRow> = sqlx::query_as(&format!(
        "SELECT {} FROM api_keys WHERE api_key = $1 FOR UPDATE NOWAIT",
        COLUMNS
    ))
    .bind(api_key)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(ApiKeyRecord::try_from).transpose()
}

pub async fn insert(
    executor: impl PgExecutor<'_>,
    api_key: &str,
    description: Option<&str>,
    pricing_plan_id: Option<i64>,
    active_until: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO api_keys (api_key, description, status, pricing_plan_id, active_until, created_at)
        VALUES ($1, $2, 'active', $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(api_key)
    .bind(description)
    .bind(pricing_plan_id)
    .bind(active_until)
    .bind(created_at)
    .fetch_one(executor)
    .await?;

    Ok(id)
}

/// Activation sets the plan and the expiry absolutely; the pro-rated refund
/// at initiation already compensated for any shortened previous term.
pub async fn activate(
    executor: impl PgExecutor<'_>,
    api_key: &str,
    pricing_plan_id: i64,
    active_until: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE api_keys SET pricing_plan_id = $2, active_until = $3 WHERE api_key = $1",
    )
    .bind(api_key)
    .bind(pricing_plan_id)
    .bind(active_until)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn revoke(
    executor: impl PgExecutor<'_>,
    api_key: &str,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("UPDATE api_keys SET status = 'revoked' WHERE api_key = $1")
        .bind(api_key)
        .execute(executor)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Key strings on a plan, for targeted cache invalidation after the plan's
/// limits change.
pub async fn keys_for_plan(
    executor: impl PgExecutor<'_>,
    pricing_plan_id: i64,
) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> =
        sqlx::query_as("SELECT api_key FROM api_keys WHERE pricing_plan_id = $1")
            .bind(pricing_plan_id)
            .fetch_all(executor)
            .await?;

    Ok(rows.into_iter().map(|(k,)| k).collect())
}
