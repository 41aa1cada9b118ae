//! In-process admin write path.
//!
//! The HTTP dashboard lives elsewhere; this facade is the contract it (and
//! operator tooling) goes through. Every mutation invalidates the key
//! cache by key string so changes take effect without waiting out the TTL.

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use tracing::info;

use crate::cache::KeyCache;
use crate::models::ShardConfig;
use crate::routing::ShardRouter;
use crate::store;

pub struct AdminFacade {
    db: PgPool,
    cache: Arc<KeyCache>,
    admin_password: Option<String>,
}

impl AdminFacade {
    pub fn new(db: PgPool, cache: Arc<KeyCache>, admin_password: Option<String>) -> Self {
        Self {
            db,
            cache,
            admin_password,
        }
    }

    /// Digest comparison so candidate length never short-circuits.
    #[allow(dead_code)]
    pub fn verify_password(&self, candidate: &str) -> bool {
        match &self.admin_password {
            Some(expected) => {
                Sha256::digest(candidate.as_bytes()) == Sha256::digest(expected.as_bytes())
            }
            None => false,
        }
    }

    #[allow(dead_code)]
    pub async fn create_api_key(
        &self,
        api_key: &str,
        description: Option<&str>,
        pricing_plan_id: Option<i64>,
        active_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let id = store::keys::insert(
            &self.db,
            api_key,
            description,
            pricing_plan_id,
            active_until,
            now,
        )
        .await
        .context("insert api key")?;

        self.cache.invalidate(api_key).await;
        info!(key_id = id, "API key created");
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn revoke_api_key(&self, api_key: &str) -> anyhow::Result<bool> {
        let revoked = store::keys::revoke(&self.db, api_key)
            .await
            .context("revoke api key")?;
        self.cache.invalidate(api_key).await;
        Ok(revoked)
    }

    /// Upserting a plan invalidates every key on it, otherwise a changed
    /// budget would not apply until each entry's TTL ran out.
    #[allow(dead_code)]
    pub async fn upsert_plan(
        &self,
        name: &str,
        requests_per_second: i32,
        requests_per_day: i32,
        price: u128,
    ) -> anyhow::Result<i64> {
        let plan_id = store::plans::upsert(
            &self.db,
            name,
            requests_per_second,
            requests_per_day,
            price,
        )
        .await
        .context("upsert pricing plan")?;

        for api_key in store::keys::keys_for_plan(&self.db, plan_id).await? {
            self.cache.invalidate(&api_key).await;
        }

        info!(plan_id, name, "Pricing plan upserted");
        Ok(plan_id)
    }

    /// Validate by actually building a router, then append the document.
    /// The reloader picks it up on its next poll.
    pub async fn publish_shard_config(
        &self,
        config: &ShardConfig,
        created_by: &str,
    ) -> anyhow::Result<i64> {
        ShardRouter::build(config)
            .map_err(|e| anyhow::anyhow!("shard configuration rejected: {}", e))?;

        let document = serde_json::to_string(config)?;
        let row_id = store::shards::insert(&self.db, &document, created_by)
            .await
            .context("store shard configuration")?;

        info!(row_id, created_by, "Shard configuration published");
        Ok(row_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::ManualTimeSource;

    fn facade(password: Option<&str>) -> AdminFacade {
        let pool = PgPool::connect_lazy("postgres://localhost/unused")
            .expect("lazy pool never connects in tests");
        AdminFacade::new(
            pool,
            Arc::new(KeyCache::new(Arc::new(ManualTimeSource::new()))),
            password.map(String::from),
        )
    }

    #[tokio::test]
    async fn password_verification() {
        let admin = facade(Some("hunter2"));
        assert!(admin.verify_password("hunter2"));
        assert!(!admin.verify_password("hunter3"));
        assert!(!admin.verify_password(""));
    }

    #[tokio::test]
    async fn no_password_means_no_access() {
        let admin = facade(None);
        assert!(!admin.verify_password("anything"));
    }
}
