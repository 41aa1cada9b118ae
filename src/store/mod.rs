//! Database access, one module per table family.
//!
//! Queries are runtime-checked sqlx with explicit column lists. Functions
//! take `impl PgExecutor` so they run against the pool or inside a
//! transaction; the `FOR UPDATE NOWAIT` paths take a connection because
//! they only make sense inside one.

pub mod keys;
pub mod payments;
pub mod plans;
pub mod shards;

use tracing::warn;

/// Postgres `unique_violation` on a specific constraint.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.code().as_deref() == Some("23505") && db.constraint() == Some(constraint)
        }
        _ => false,
    }
}

/// Postgres `lock_not_available`, raised by `NOWAIT` when a row is held.
pub fn is_lock_unavailable(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.code().as_deref() == Some("55P03"),
        _ => false,
    }
}

/// Amounts are stored as decimal text. Values we wrote always parse; a
/// corrupted row degrades to zero rather than poisoning the request.
pub(crate) fn parse_amount(raw: &str) -> u128 {
    raw.trim().parse().unwrap_or_else(|_| {
        warn!(raw = %raw, "Unparseable amount in database, treating as 0");
        0
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_amount_handles_valid_and_garbage() {
        assert_eq!(parse_amount("1000"), 1000);
        assert_eq!(parse_amount(" 42 "), 42);
        assert_eq!(parse_amount("not-a-number"), 0);
        assert_eq!(parse_amount(""), 0);
    }
}
