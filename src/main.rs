use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

use clickresearch_stats::api::{self, AppState};
use clickresearch_stats::auth::DomainCache;
use clickresearch_stats::cache::TtlCache;
use clickresearch_stats::config::{Config, StoreBackend};
use clickresearch_stats::service::StatsService;
use clickresearch_stats::storage::{AnalyticsStore, ClickHouseStore, DuckDbStore};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    info!("Loaded configuration");

    // Initialize the analytics store
    let store: Arc<dyn AnalyticsStore> = match config.store.backend {
        StoreBackend::DuckDb => {
            info!("Using embedded DuckDB store");
            let store = DuckDbStore::connect(&config.store.duckdb, &config.store.s3)?;
            store.spawn_refresh_loop();
            Arc::new(store)
        }
        StoreBackend::ClickHouse => {
            info!("Using ClickHouse store: {}", config.store.clickhouse.url);
            let store = ClickHouseStore::connect(&config.store.clickhouse, &config.store.s3).await?;
            store.start().await;
            Arc::new(store)
        }
    };

    let cache = Arc::new(TtlCache::new(Duration::from_secs(config.cache.ttl_secs)));
    info!("Query cache TTL {}s", config.cache.ttl_secs);

    let domains = match config.domain_sync.clone() {
        Some(sync) => {
            info!("Domain sync enabled against {}", sync.stats_url);
            Some(Arc::new(DomainCache::new(sync).await?))
        }
        None => {
            info!("Domain sync disabled");
            None
        }
    };

    let service = Arc::new(StatsService::new(
        Arc::clone(&store),
        Arc::clone(&cache),
        &config.query,
    ));

    let router = api::create_api_router(
        AppState {
            service,
            domains: domains.clone(),
        },
        &config.cors,
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Stats server listening on http://{}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    if let Some(domains) = domains {
        domains.stop();
    }
    cache.shutdown();
    store.close().await?;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
