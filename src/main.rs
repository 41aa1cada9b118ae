mod admin;
mod auth;
mod background_jobs;
mod cache;
mod config;
mod error;
mod handlers;
mod models;
mod payment;
mod rate_limit;
mod routing;
mod store;
mod time_source;

use axum::{
    extract::DefaultBodyLimit,
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use admin::AdminFacade;
use auth::ApiKeyAuth;
use cache::KeyCache;
use config::Config;
use models::{ShardConfig, ShardInfo};
use payment::sdk::{AggregatorTokenSdk, TrustBase};
use payment::{PaymentEngine, PaymentSettings};
use rate_limit::RateLimiter;
use routing::{RouterHandle, ShardRouter};
use time_source::{SystemTimeSource, TimeSource};

#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::PgPool,
    pub config: Arc<Config>,
    pub http: reqwest::Client,
    pub auth: Arc<ApiKeyAuth>,
    pub rate_limiter: Arc<RateLimiter>,
    pub router: RouterHandle,
    pub engine: Arc<PaymentEngine>,
    pub time: Arc<dyn TimeSource>,
}

fn main() -> anyhow::Result<()> {
    let config = Config::from_env().map_err(|e| anyhow::anyhow!("{}", e))?;

    // WORKER_THREADS > 0 pins the scheduler width; 0 sizes to the machine.
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if config.worker_threads > 0 {
        builder.worker_threads(config.worker_threads);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "aggregator_proxy=debug,tower_http=debug".into()),
        )
        .init();

    let config = Arc::new(config);
    info!("Config loaded successfully");

    // Database pool; DB_USER/DB_PASSWORD override url credentials
    let mut connect_options = PgConnectOptions::from_str(&config.database_url)?;
    if let Some(user) = &config.db_user {
        connect_options = connect_options.username(user);
    }
    if let Some(password) = &config.db_password {
        connect_options = connect_options.password(password);
    }
    let db = PgPoolOptions::new()
        .max_connections(config.db_pool_size)
        .connect_with(connect_options)
        .await?;
    info!("Database connected");

    sqlx::migrate!("./migrations").run(&db).await?;
    info!("Database migrations completed");

    // One shared client for backend forwarding, SDK calls and probes
    let http = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    let time: Arc<dyn TimeSource> = Arc::new(SystemTimeSource::new());
    let cache = Arc::new(KeyCache::new(time.clone()));
    let rate_limiter = Arc::new(RateLimiter::new(time.clone()));
    let api_key_auth = Arc::new(ApiKeyAuth::new(cache.clone()));
    let admin = AdminFacade::new(db.clone(), cache.clone(), config.admin_password.clone());

    let (initial_router, last_row_id) = load_initial_router(&db, &config, &admin).await;
    if initial_router.is_failsafe() {
        warn!("Starting with failsafe router: proxied traffic will be refused until a valid shard configuration is stored");
    }
    let router = RouterHandle::new(initial_router);

    let token_type = resolve_token_type(&http, &config).await;
    let trust_base = load_trust_base(&config);

    let sdk = Arc::new(AggregatorTokenSdk::new(http.clone(), router.clone()));
    let engine = Arc::new(PaymentEngine::new(
        db.clone(),
        sdk,
        cache.clone(),
        time.clone(),
        PaymentSettings {
            server_secret: config.server_secret.clone(),
            token_type,
            accepted_coin_id: config.accepted_coin_id.clone(),
            minimum_payment_amount: config.minimum_payment_amount,
            trust_base,
        },
    ));

    // Background jobs
    tokio::spawn(background_jobs::run_shard_config_reloader(
        db.clone(),
        router.clone(),
        Duration::from_secs(config.shard_reload_interval_seconds),
        last_row_id,
    ));
    tokio::spawn(background_jobs::run_session_expiry_sweep(
        db.clone(),
        time.clone(),
        background_jobs::SESSION_EXPIRY_SWEEP_INTERVAL,
    ));
    tokio::spawn(background_jobs::run_key_cache_sweep(
        cache.clone(),
        cache::KEY_CACHE_SWEEP_INTERVAL,
    ));
    info!("Background jobs started");

    let state = AppState {
        db,
        config: config.clone(),
        http,
        auth: api_key_auth,
        rate_limiter,
        router,
        engine,
        time,
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(
            config
                .cors_allowed_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        );

    // Reserved routes; everything else falls through to the proxy pipeline.
    let api = Router::new()
        .route("/api/payment/initiate", post(handlers::payment::initiate_payment))
        .route("/api/payment/complete", post(handlers::payment::complete_payment))
        .route("/api/payment/plans", get(handlers::payment::list_plans))
        .route("/api/payment/key/:api_key", get(handlers::payment::key_status))
        .route(
            "/api/payment/session/:session_id",
            get(handlers::payment::session_status),
        )
        .route("/config/shards", get(handlers::shards::get_shard_config))
        .route("/health", get(handlers::health::health))
        .layer(DefaultBodyLimit::max(handlers::proxy::MAX_BODY_BYTES))
        .layer(cors);

    let app = Router::new()
        .merge(api)
        .fallback(handlers::proxy::proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Aggregator proxy listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Router for startup: the stored document when valid, else an implicit
/// catch-all for TARGET_URL, else the failsafe.
async fn load_initial_router(
    db: &sqlx::PgPool,
    config: &Config,
    admin: &AdminFacade,
) -> (ShardRouter, Option<i64>) {
    match store::shards::latest(db).await {
        Ok(Some(row)) => match background_jobs::parse_and_build(&row.document) {
            Ok(router) => {
                info!(
                    row_id = row.id,
                    version = router.version(),
                    "Loaded shard configuration"
                );
                (router, Some(row.id))
            }
            Err(e) => {
                warn!(
                    row_id = row.id,
                    "Stored shard configuration is invalid ({}); installing failsafe router",
                    e
                );
                (ShardRouter::failsafe(), Some(row.id))
            }
        },
        Ok(None) => match &config.target_url {
            Some(target) => {
                let catch_all = ShardConfig {
                    version: 0,
                    shards: vec![ShardInfo {
                        id: 1,
                        url: target.clone(),
                    }],
                };
                match ShardRouter::build(&catch_all) {
                    Ok(router) => {
                        let row_id = match admin.publish_shard_config(&catch_all, "startup").await
                        {
                            Ok(id) => Some(id),
                            Err(e) => {
                                warn!("Could not persist catch-all shard configuration: {}", e);
                                None
                            }
                        };
                        info!("Installed catch-all shard configuration for {}", target);
                        (router, row_id)
                    }
                    Err(e) => {
                        warn!("TARGET_URL is not a usable shard target: {}", e);
                        (ShardRouter::failsafe(), None)
                    }
                }
            }
            None => {
                warn!("No shard configuration stored and TARGET_URL not set");
                (ShardRouter::failsafe(), None)
            }
        },
        Err(e) => {
            warn!("Failed to load shard configuration: {}", e);
            (ShardRouter::failsafe(), None)
        }
    }
}

/// Resolve TOKEN_TYPE_NAME through the optional TOKEN_TYPE_IDS_URL registry,
/// falling back to the built-in testnet type.
async fn resolve_token_type(client: &reqwest::Client, config: &Config) -> Vec<u8> {
    if let Some(url) = &config.token_type_ids_url {
        match fetch_token_type(client, url, &config.token_type_name).await {
            Ok(token_type) => {
                info!(
                    "Resolved token type '{}' from {}",
                    config.token_type_name, url
                );
                return token_type;
            }
            Err(e) => warn!(
                "Failed to resolve token type from {}: {}. Using built-in testnet type.",
                url, e
            ),
        }
    }
    hex::decode(config::TESTNET_TOKEN_TYPE).expect("built-in token type is valid hex")
}

async fn fetch_token_type(
    client: &reqwest::Client,
    url: &str,
    name: &str,
) -> anyhow::Result<Vec<u8>> {
    let registry: HashMap<String, String> = client.get(url).send().await?.json().await?;
    let hex_id = registry
        .get(name)
        .ok_or_else(|| anyhow::anyhow!("token type '{}' not in registry", name))?;
    Ok(hex::decode(hex_id.trim().trim_start_matches("0x"))?)
}

fn load_trust_base(config: &Config) -> Option<TrustBase> {
    match &config.trust_base_path {
        Some(path) => match TrustBase::load(path) {
            Ok(trust_base) => {
                info!("Trust base loaded from {:?}", path);
                Some(trust_base)
            }
            Err(e) => {
                warn!(
                    "Failed to load trust base from {:?}: {}. Verification is structural only.",
                    path, e
                );
                None
            }
        },
        None => {
            warn!("TRUST_BASE_PATH not set; token verification is structural only");
            None
        }
    }
}
