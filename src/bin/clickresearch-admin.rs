use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use clickresearch_stats::auth::DomainCache;
use clickresearch_stats::cache::TtlCache;
use clickresearch_stats::config::{Config, StoreBackend};
use clickresearch_stats::service::{StatsParams, StatsService};
use clickresearch_stats::storage::{AnalyticsStore, ClickHouseStore, DuckDbStore};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "clickresearch-admin")]
#[command(about = "ClickResearch stats maintenance CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load the event history from object storage once and report the row count
    Sync,
    /// Print the overview for a site
    Overview {
        /// Site domain (defaults to DEFAULT_DOMAIN)
        #[arg(long)]
        domain: Option<String>,
        /// today, 7d, 30d or 90d
        #[arg(long, default_value = "7d")]
        period: String,
    },
    /// Fetch and list the registered domains
    Domains,
}

async fn open_store(config: &Config) -> Result<Arc<dyn AnalyticsStore>> {
    let store: Arc<dyn AnalyticsStore> = match config.store.backend {
        StoreBackend::DuckDb => Arc::new(DuckDbStore::connect(
            &config.store.duckdb,
            &config.store.s3,
        )?),
        StoreBackend::ClickHouse => Arc::new(
            ClickHouseStore::connect(&config.store.clickhouse, &config.store.s3).await?,
        ),
    };
    Ok(store)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Sync => {
            let store = open_store(&config).await?;
            let rows = store.refresh().await.context("sync failed")?;
            println!("✓ Loaded {} events", rows);
            store.close().await?;
        }
        Commands::Overview { domain, period } => {
            let store = open_store(&config).await?;
            store.refresh().await.context("sync failed")?;

            let cache = Arc::new(TtlCache::new(Duration::from_secs(config.cache.ttl_secs)));
            let service = StatsService::new(Arc::clone(&store), Arc::clone(&cache), &config.query);
            let params = StatsParams {
                domain,
                period: Some(period),
                ..StatsParams::default()
            };

            let overview = service.overview(&params).await?;
            println!("{}", serde_json::to_string_pretty(&overview)?);

            cache.shutdown();
            store.close().await?;
        }
        Commands::Domains => {
            let sync = config
                .domain_sync
                .clone()
                .context("STATS_URL and SYNC_SECRET must be set")?;
            let domains = DomainCache::new(sync).await?;

            if !domains.is_populated() {
                anyhow::bail!("could not load domains from the stats service or the snapshot");
            }

            println!("Registered domains ({}):", domains.len());
            for domain in domains.domains() {
                println!("  {}", domain);
            }
            domains.stop();
        }
    }

    Ok(())
}
