use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgExecutor};
use std::str::FromStr;
use uuid::Uuid;

use super::parse_amount;
use crate::models::{PaymentSession, PaymentSessionStatus};

/// Partial unique index: at most one pending session per key.
pub const PENDING_PER_KEY_CONSTRAINT: &str = "payment_sessions_one_pending_per_key";
/// Partial unique index: a blockchain request id pays at most one session.
pub const REQUEST_ID_CONSTRAINT: &str = "payment_sessions_request_id_key";

const COLUMNS: &str = "id, api_key, payment_address, receiver_nonce, status, \
     target_plan_id, amount_required, refund_amount, token_received, \
     should_create_key, request_id, completion_request_json, completion_request_at, \
     created_at, completed_at, cancelled_at, expires_at";

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: Uuid,
    api_key: Option<String>,
    payment_address: String,
    receiver_nonce: String,
    status: String,
    target_plan_id: i64,
    amount_required: String,
    refund_amount: String,
    token_received: Option<String>,
    should_create_key: bool,
    request_id: Option<String>,
    completion_request_json: Option<String>,
    completion_request_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    cancelled_at: Option<DateTime<Utc>>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<SessionRow> for PaymentSession {
    type Error = sqlx::Error;

    fn try_from(row: SessionRow) -> Result<Self, Self::Error> {
        let status = PaymentSessionStatus::from_str(&row.status)
            .map_err(|e| sqlx::Error::Decode(e.into()))?;
        Ok(PaymentSession {
            id: row.id,
            api_key: row.api_key,
            payment_address: row.payment_address,
            receiver_nonce: row.receiver_nonce,
            status,
            target_plan_id: row.target_plan_id,
            amount_required: parse_amount(&row.amount_required),
            refund_amount: parse_amount(&row.refund_amount),
            token_received: row.token_received,
            should_create_key: row.should_create_key,
            request_id: row.request_id,
            completion_request_json: row.completion_request_json,
            completion_request_at: row.completion_request_at,
            created_at: row.created_at,
            completed_at: row.completed_at,
            cancelled_at: row.cancelled_at,
            expires_at: row.expires_at,
        })
    }
}

pub struct NewSession<'a> {
    pub id: Uuid,
    pub api_key: Option<&'a str>,
    pub payment_address: &'a str,
    /// Hex encoded
    pub receiver_nonce: &'a str,
    pub target_plan_id: i64,
    pub amount_required: u128,
    pub refund_amount: u128,
    pub should_create_key: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Insert a pending session. A unique violation on the pending-per-key
/// index surfaces as the raw sqlx error for the caller to classify.
pub async fn insert_session(
    executor: impl PgExecutor<'_>,
    session: &NewSession<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO payment_sessions
            (id, api_key, payment_address, receiver_nonce, status, target_plan_id,
             amount_required, refund_amount, should_create_key, created_at, expires_at)
        VALUES ($1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9, $10)
        "#,
    )
    .bind(session.id)
    .bind(session.api_key)
    .bind(session.payment_address)
    .bind(session.receiver_nonce)
    .bind(session.target_plan_id)
    .bind(session.amount_required.to_string())
    .bind(session.refund_amount.to_string())
    .bind(session.should_create_key)
    .bind(session.created_at)
    .bind(session.expires_at)
    .execute(executor)
    .await?;

    Ok(())
}

pub async fn cancel_pending_for_key(
    executor: impl PgExecutor<'_>,
    api_key: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_sessions SET status = 'cancelled', cancelled_at = $2
         WHERE api_key = $1 AND status = 'pending'",
    )
    .bind(api_key)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Idempotent early record of a completion attempt. Updates only when the
/// session has no completion stored yet or stores exactly this one; returns
/// the number of rows touched so the caller can tell the difference.
pub async fn record_completion_request(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    request_id: &str,
    completion_request_json: &str,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE payment_sessions
        SET request_id = $2, completion_request_json = $3, completion_request_at = $4
        WHERE id = $1
          AND (request_id IS NULL OR request_id = $2)
          AND (completion_request_json IS NULL OR completion_request_json = $3)
        "#,
    )
    .bind(id)
    .bind(request_id)
    .bind(completion_request_json)
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

pub async fn find_by_id(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<Option<PaymentSession>, sqlx::Error> {
    let row: Option<SessionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM payment_sessions WHERE id = $1",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(executor)
    .await?;

    row.map(PaymentSession::try_from).transpose()
}

/// Exclusive row lock, failing fast on contention. Locked only after the
/// api_keys row (lock ordering).
pub async fn find_by_id_for_update(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<PaymentSession>, sqlx::Error> {
    let row: Option<SessionRow> = sqlx::query_as(&format!(
        "SELECT {} FROM payment_sessions WHERE id = $1 FOR UPDATE NOWAIT",
        COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(PaymentSession::try_from).transpose()
}

pub async fn mark_failed(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE payment_sessions SET status = 'failed' WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn mark_expired(
    executor: impl PgExecutor<'_>,
    id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE payment_sessions SET status = 'expired' WHERE id = $1")
        .bind(id)
        .execute(executor)
        .await?;
    Ok(())
}

pub async fn mark_completed(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    token_received: &str,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE payment_sessions
         SET status = 'completed', token_received = $2, completed_at = $3
         WHERE id = $1",
    )
    .bind(id)
    .bind(token_received)
    .bind(now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Record the freshly generated key string on a new-key session.
pub async fn set_session_key(
    executor: impl PgExecutor<'_>,
    id: Uuid,
    api_key: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE payment_sessions SET api_key = $2 WHERE id = $1")
        .bind(id)
        .bind(api_key)
        .execute(executor)
        .await?;
    Ok(())
}

/// Lazy expiry sweep; completePayment also checks inline.
pub async fn expire_stale(
    executor: impl PgExecutor<'_>,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE payment_sessions SET status = 'expired'
         WHERE status = 'pending' AND expires_at < $1",
    )
    .bind(now)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
