//! Background jobs for the proxy
//!
//! Periodic tasks spawned at startup:
//! - Shard configuration reloader (rebuild + swap the router)
//! - Payment session expiry sweep
//! - Key cache cleanup

use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::KeyCache;
use crate::models::ShardConfig;
use crate::routing::{RouterHandle, ShardRouter};
use crate::store;
use crate::time_source::TimeSource;

pub const SESSION_EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Poll the shard store; when a new document appears, build and validate a
/// router and swap it in. Invalid documents keep the previous router and
/// stay in the store for the operator to fix.
pub async fn run_shard_config_reloader(
    db: PgPool,
    router: RouterHandle,
    interval: Duration,
    mut last_row_id: Option<i64>,
) {
    info!(
        "Shard config reloader started (interval={}s)",
        interval.as_secs()
    );

    loop {
        tokio::time::sleep(interval).await;

        let row = match store::shards::latest(&db).await {
            Ok(Some(row)) => row,
            Ok(None) => continue,
            Err(e) => {
                warn!("Failed to poll shard configuration: {}", e);
                continue;
            }
        };

        if Some(row.id) == last_row_id {
            continue;
        }

        match parse_and_build(&row.document) {
            Ok(new_router) => {
                info!(
                    row_id = row.id,
                    version = new_router.version(),
                    author = %row.created_by,
                    "Installing new shard configuration"
                );
                router.store(new_router).await;
            }
            Err(e) => {
                warn!(
                    row_id = row.id,
                    "Rejecting shard configuration, keeping previous router: {}",
                    e
                );
            }
        }
        // Seen either way; a fix arrives as a new row.
        last_row_id = Some(row.id);
    }
}

pub fn parse_and_build(document: &str) -> Result<ShardRouter, String> {
    let config: ShardConfig =
        serde_json::from_str(document).map_err(|e| format!("invalid document: {}", e))?;
    ShardRouter::build(&config).map_err(|e| e.to_string())
}

/// Mark pending sessions past their expiry. Completion also checks inline;
/// this sweep just keeps the table honest.
pub async fn run_session_expiry_sweep(
    db: PgPool,
    time: Arc<dyn TimeSource>,
    interval: Duration,
) {
    info!(
        "Session expiry sweep started (interval={}s)",
        interval.as_secs()
    );

    loop {
        tokio::time::sleep(interval).await;

        match store::payments::expire_stale(&db, time.now()).await {
            Ok(expired) if expired > 0 => {
                info!("Expired {} stale payment sessions", expired);
            }
            Ok(_) => {}
            Err(e) => warn!("Session expiry sweep failed: {}", e),
        }
    }
}

pub async fn run_key_cache_sweep(cache: Arc<KeyCache>, interval: Duration) {
    info!("Key cache sweep started (interval={}s)", interval.as_secs());

    loop {
        tokio::time::sleep(interval).await;

        let removed = cache.sweep().await;
        if removed > 0 {
            debug!("Key cache sweep removed {} expired entries", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_build_accepts_valid_documents() {
        let router = parse_and_build(
            r#"{"version":2,"shards":[{"id":2,"url":"http://a:3000"},{"id":3,"url":"http://b:3000"}]}"#,
        )
        .unwrap();
        assert_eq!(router.version(), 2);
    }

    #[test]
    fn parse_and_build_rejects_garbage_and_incomplete() {
        assert!(parse_and_build("not json").is_err());
        assert!(parse_and_build(r#"{"version":1,"shards":[]}"#).is_err());
        assert!(
            parse_and_build(r#"{"version":1,"shards":[{"id":2,"url":"http://a:3000"}]}"#)
                .is_err()
        );
    }
}
