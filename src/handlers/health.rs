//! Health probe: the database plus every distinct aggregator url behind
//! the live router, checked in parallel.

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::error;

use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub database: String,
    pub aggregators: BTreeMap<String, String>,
}

pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthReport>) {
    let router = state.router.load().await;
    let urls: Vec<String> = router.target_urls().map(String::from).collect();

    let (database, aggregators) = tokio::join!(
        check_database(&state),
        check_aggregators(&state, urls),
    );

    let healthy = database == "ok" && aggregators.values().all(|status| status == "ok");

    let report = HealthReport {
        status: if healthy { "healthy" } else { "unhealthy" }.to_string(),
        database,
        aggregators,
    };

    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (http_status, Json(report))
}

async fn check_database(state: &AppState) -> String {
    match sqlx::query_as::<_, (i32,)>("SELECT 1")
        .fetch_one(&state.db)
        .await
    {
        Ok(_) => "ok".to_string(),
        Err(e) => {
            error!("Health check: database error: {}", e);
            "error".to_string()
        }
    }
}

async fn check_aggregators(
    state: &AppState,
    urls: Vec<String>,
) -> BTreeMap<String, String> {
    let mut probes = JoinSet::new();
    for url in urls {
        let client = state.http.clone();
        let timeout = state.config.idle_timeout();
        probes.spawn(async move {
            let status = probe_aggregator(&client, &url, timeout).await;
            (url, status)
        });
    }

    let mut results = BTreeMap::new();
    while let Some(joined) = probes.join_next().await {
        if let Ok((url, status)) = joined {
            results.insert(url, status);
        }
    }
    results
}

/// Any HTTP answer counts as reachable; the probe is about connectivity,
/// not backend semantics.
async fn probe_aggregator(client: &reqwest::Client, url: &str, timeout: Duration) -> String {
    let health_url = format!("{}/health", url.trim_end_matches('/'));
    match client.get(&health_url).timeout(timeout).send().await {
        Ok(_) => "ok".to_string(),
        Err(e) if e.is_timeout() => "timeout".to_string(),
        Err(e) => format!("unreachable: {}", e),
    }
}
