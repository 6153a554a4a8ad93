mod billing;
mod config;
mod constants;
mod crs;
mod db;
mod error;
mod oauth;
mod ops;
mod pipeline;
mod ratelimit;
mod redis;
mod routes;
mod scheduler;
mod store;
mod transforms;
mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::ServiceExt;
use axum::{
    Router,
    routing::{get, post},
};
use clap::Parser;
use reqwest::Client;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::normalize_path::NormalizePath;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use billing::{BillingCache, BillingGate};
use config::Config;
use oauth::{AccessTokenCache, RefreshDriver};
use ops::MetricsCollector;
use ratelimit::{QuotaPrecheck, RateLimitEngine};
use redis::RedisStore;
use scheduler::{AccountScheduler, DeferredScheduler, SlotBroker};
use store::{
    AccountStore, ApiKeyStore, GroupStore, SubscriptionStore, UsageLogStore, UserStore,
};
use upstream::UpstreamClients;

pub struct AppState {
    pub config: Config,
    pub accounts: AccountStore,
    pub api_keys: ApiKeyStore,
    pub users: UserStore,
    pub groups: GroupStore,
    pub usage_log: UsageLogStore,
    pub redis: RedisStore,
    pub scheduler: AccountScheduler,
    pub broker: Arc<SlotBroker>,
    pub engine: RateLimitEngine,
    pub billing: Arc<BillingCache>,
    pub gate: BillingGate,
    pub token_cache: AccessTokenCache,
    pub clients: UpstreamClients,
    pub deferred: DeferredScheduler,
}

#[derive(Parser)]
#[command(name = "llm-gateway")]
#[command(about = "Multi-tenant API gateway for LLM upstreams")]
struct Args {
    /// Host to bind to
    #[arg(short = 'H', long, env = "LLM_GATEWAY_HOST")]
    host: Option<String>,

    /// Port to bind to
    #[arg(short, long, env = "LLM_GATEWAY_PORT")]
    port: Option<u16>,

    /// Import accounts from a CRS export file, then exit
    #[arg(long, value_name = "FILE")]
    crs_import: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = Config::from_env();

    db::init_db(&config.db_path())
        .await
        .expect("Failed to initialize database");

    let redis = RedisStore::connect(config.redis_url.as_deref()).await;

    // Shared HTTP client with connection pooling; per-proxy clients are
    // derived lazily.
    let http_client = Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .expect("Failed to create HTTP client");

    let refreshers = Arc::new(oauth::build_refreshers(
        http_client.clone(),
        config.gemini_oauth.clone(),
    ));

    // One-shot import mode.
    if let Some(path) = &args.crs_import {
        let sync = crs::CrsSync::new(
            AccountStore::new(),
            store::ProxyStore::new(),
            refreshers.clone(),
        );
        match sync.import_file(path).await {
            Ok(summary) => {
                println!(
                    "import finished: {} created, {} updated, {} skipped, {} failed",
                    summary.created, summary.updated, summary.skipped, summary.failed
                );
                for item in summary.items.iter().filter(|i| i.error.is_some()) {
                    println!("  {}: {:?} ({})", item.crs_id, item.action, item.error.as_deref().unwrap());
                }
            }
            Err(e) => {
                eprintln!("import failed: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let host = args.host.clone().unwrap_or_else(|| config.host.clone());
    let port = args.port.unwrap_or(config.port);

    let (stop_tx, stop_rx) = watch::channel(false);

    let deferred = DeferredScheduler::start(stop_rx.clone());
    let broker = Arc::new(SlotBroker::new(
        Duration::from_secs(config.scheduling.slot_ttl_secs),
        Duration::from_secs(config.scheduling.acquire_timeout_secs),
    ));
    let billing = Arc::new(BillingCache::new(
        UserStore::new(),
        SubscriptionStore::new(),
        redis.clone(),
    ));

    let state = Arc::new(AppState {
        accounts: AccountStore::new(),
        api_keys: ApiKeyStore::new(),
        users: UserStore::new(),
        groups: GroupStore::new(),
        usage_log: UsageLogStore::new(),
        redis: redis.clone(),
        scheduler: AccountScheduler::new(
            AccountStore::new(),
            GroupStore::new(),
            redis.clone(),
            QuotaPrecheck::new(UsageLogStore::new()),
        ),
        broker: broker.clone(),
        engine: RateLimitEngine::new(
            AccountStore::new(),
            redis.clone(),
            config.rate_limit.overload_cooldown_minutes,
        ),
        billing: billing.clone(),
        gate: BillingGate::new(billing.clone()),
        token_cache: AccessTokenCache::new(AccountStore::new(), redis.clone(), refreshers.clone()),
        clients: UpstreamClients::new(http_client),
        deferred,
        config,
    });

    // Background loops.
    let driver = RefreshDriver::new(
        AccountStore::new(),
        oauth::build_refreshers(
            Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to create refresh HTTP client"),
            state.config.gemini_oauth.clone(),
        ),
        state.config.token_refresh.clone(),
    );
    tokio::spawn(driver.run(stop_rx.clone()));

    {
        let broker = broker.clone();
        let interval = Duration::from_secs(state.config.scheduling.slot_cleanup_interval_secs);
        let stop = stop_rx.clone();
        tokio::spawn(async move {
            broker.run_cleanup(interval, stop).await;
        });
    }

    if state.config.ops_enabled {
        let collector = MetricsCollector::new(redis.clone(), UsageLogStore::new());
        tokio::spawn(collector.run(stop_rx.clone()));
    }

    let app = NormalizePath::trim_trailing_slash(
        Router::new()
            .route("/health", get(routes::health::health))
            .route("/version", get(routes::health::version))
            .route("/v1/messages", post(routes::claude::messages))
            .route(
                "/v1/messages/count_tokens",
                post(routes::claude::count_tokens),
            )
            .route("/v1/chat/completions", post(routes::openai::chat_completions))
            .route(
                "/v1beta/models/{model_action}",
                post(routes::gemini::model_action),
            )
            .route(
                "/antigravity/v1/messages",
                post(routes::claude::messages_antigravity),
            )
            .route(
                "/antigravity/v1beta/models/{model_action}",
                post(routes::gemini::model_action_antigravity),
            )
            .layer(CorsLayer::permissive())
            .with_state(state.clone()),
    );

    let addr: SocketAddr = format!("{host}:{port}").parse().expect("Invalid address");
    info!("Starting llm-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(
        listener,
        ServiceExt::<axum::extract::Request>::into_make_service(app),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .unwrap();

    // Stop background loops and drain the billing write-back queue.
    let _ = stop_tx.send(true);
    billing.shutdown().await;
    info!("shutdown complete");
}
