//! API key extraction and effective-key lookup.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use regex::Regex;
use sqlx::PgPool;
use std::sync::Arc;

use crate::cache::{CacheLookup, KeyCache};
use crate::models::KeyLimits;
use crate::store;

pub struct ApiKeyAuth {
    cache: Arc<KeyCache>,
    bearer: Regex,
}

impl ApiKeyAuth {
    pub fn new(cache: Arc<KeyCache>) -> Self {
        Self {
            cache,
            // RFC 6750 token68 grammar, case-insensitive scheme
            bearer: Regex::new(r"^\s*[Bb]earer\s+([A-Za-z0-9\-._~+/]+=*)\s*$")
                .expect("bearer regex is valid"),
        }
    }

    /// `Authorization: Bearer <token>` wins over `X-API-Key`.
    pub fn extract_key(&self, headers: &HeaderMap) -> Option<String> {
        if let Some(value) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
            if let Some(captures) = self.bearer.captures(value) {
                return captures.get(1).map(|m| m.as_str().to_string());
            }
        }
        headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    /// Budget for an effective key, through the cache. A cached negative
    /// blocks database lookups until the TTL runs out or an admin write
    /// invalidates the entry.
    pub async fn effective_limits(
        &self,
        pool: &PgPool,
        api_key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<KeyLimits>, sqlx::Error> {
        if let CacheLookup::Hit(limits) = self.cache.lookup(api_key).await {
            return Ok(limits);
        }

        let limits = store::keys::find_limits_if_effective(pool, api_key, now).await?;
        self.cache.insert(api_key, limits).await;
        Ok(limits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time_source::ManualTimeSource;
    use axum::http::HeaderValue;

    fn auth() -> ApiKeyAuth {
        ApiKeyAuth::new(Arc::new(KeyCache::new(Arc::new(ManualTimeSource::new()))))
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_extraction() {
        let auth = auth();
        assert_eq!(
            auth.extract_key(&headers(&[("authorization", "Bearer supersecret")])),
            Some("supersecret".to_string())
        );
        assert_eq!(
            auth.extract_key(&headers(&[("authorization", "  bearer  tok-en._~+/==  ")])),
            Some("tok-en._~+/==".to_string())
        );
        // Other schemes are not API keys
        assert_eq!(
            auth.extract_key(&headers(&[("authorization", "Basic dXNlcjpwYXNz")])),
            None
        );
    }

    #[test]
    fn x_api_key_fallback() {
        let auth = auth();
        assert_eq!(
            auth.extract_key(&headers(&[("x-api-key", "sk_abc")])),
            Some("sk_abc".to_string())
        );
        // Bearer wins when both are present
        assert_eq!(
            auth.extract_key(&headers(&[
                ("authorization", "Bearer from-bearer"),
                ("x-api-key", "from-header")
            ])),
            Some("from-bearer".to_string())
        );
        assert_eq!(auth.extract_key(&headers(&[])), None);
    }
}
