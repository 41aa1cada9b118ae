use sqlx::PgExecutor;

use super::parse_amount;
use crate::models::PricingPlan;

#[derive(sqlx::FromRow)]
struct PlanRow {
    id: i64,
    name: String,
    requests_per_second: i32,
    requests_per_day: i32,
    price: String,
}

impl From<PlanRow> for PricingPlan {
    fn from(row: PlanRow) -> Self {
        PricingPlan {
            id: row.id,
            name: row.name,
            requests_per_second: row.requests_per_second,
            requests_per_day: row.requests_per_day,
            price: parse_amount(&row.price),
        }
    }
}

pub async fn find(
    executor: impl PgExecutor<'_>,
    id: i64,
) -> Result<Option<PricingPlan>, sqlx::Error> {
    let row: Option<PlanRow> = sqlx::query_as(
        "SELECT id, name, requests_per_second, requests_per_day, price
         FROM pricing_plans WHERE id = $1",
    )
    .bind(id)
    .fetch_optional(executor)
    .await?;

    Ok(row.map(PricingPlan::from))
}

pub async fn list(executor: impl PgExecutor<'_>) -> Result<Vec<PricingPlan>, sqlx::Error> {
    let rows: Vec<PlanRow> = sqlx::query_as(
        "SELECT id, name, requests_per_second, requests_per_day, price
         FROM pricing_plans ORDER BY id",
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(PricingPlan::from).collect())
}

pub async fn upsert(
    executor: impl PgExecutor<'_>,
    name: &str,
    requests_per_second: i32,
    requests_per_day: i32,
    price: u128,
) -> Result<i64, sqlx::Error> {
    let (id,): (i64,) = sqlx::query_as(
        r#"
        INSERT INTO pricing_plans (name, requests_per_second, requests_per_day, price)
        VALUES ($1, $2, $3, $4)
        ON CONFLICT (name) DO UPDATE
        SET requests_per_second = EXCLUDED.requests_per_second,
            requests_per_day = EXCLUDED.requests_per_day,
            price = EXCLUDED.price
        RETURNING id
        "#,
    )
    .bind(name)
    .bind(requests_per_second)
    .bind(requests_per_day)
    .bind(price.to_string())
    .fetch_one(executor)
    .await?;

    Ok(id)
}
