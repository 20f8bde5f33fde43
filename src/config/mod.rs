use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub query: QueryConfig,
    /// Present only when both STATS_URL and SYNC_SECRET are set
    #[serde(default)]
    pub domain_sync: Option<DomainSyncConfig>,
    pub cors: CorsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    DuckDb,
    ClickHouse,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub s3: S3Config,
    pub duckdb: DuckDbConfig,
    pub clickhouse: ClickHouseConfig,
}

/// Object storage holding the Parquet event batches
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct S3Config {
    /// Host[:port] without scheme
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    /// Key prefix, usually ending in `/`
    pub prefix: String,
    #[serde(default = "S3Config::default_use_ssl")]
    pub use_ssl: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuckDbConfig {
    #[serde(default = "DuckDbConfig::default_threads")]
    pub threads: i64,
    #[serde(default = "DuckDbConfig::default_memory_limit")]
    pub memory_limit: String,
    #[serde(default = "DuckDbConfig::default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    /// Read Parquet from this glob instead of S3 (local files, tests)
    #[serde(default)]
    pub parquet_glob: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClickHouseConfig {
    pub url: String,
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "ClickHouseConfig::default_sync_interval_secs")]
    pub sync_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "CacheConfig::default_ttl_secs")]
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Per-request deadline for store queries
    #[serde(default = "QueryConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Domain used when a request names none
    pub default_domain: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainSyncConfig {
    pub stats_url: String,
    pub sync_secret: String,
    pub snapshot_path: PathBuf,
    #[serde(default = "DomainSyncConfig::default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default = "DomainSyncConfig::default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl S3Config {
    const fn default_use_ssl() -> bool {
        true
    }
}

impl DuckDbConfig {
    const fn default_threads() -> i64 {
        2
    }

    fn default_memory_limit() -> String {
        "512MB".to_string()
    }

    const fn default_refresh_interval_secs() -> u64 {
        300
    }
}

impl Default for DuckDbConfig {
    fn default() -> Self {
        Self {
            threads: Self::default_threads(),
            memory_limit: Self::default_memory_limit(),
            refresh_interval_secs: Self::default_refresh_interval_secs(),
            parquet_glob: None,
        }
    }
}

impl ClickHouseConfig {
    const fn default_sync_interval_secs() -> u64 {
        300
    }
}

impl CacheConfig {
    const fn default_ttl_secs() -> u64 {
        300
    }
}

impl QueryConfig {
    const fn default_timeout_ms() -> u64 {
        30_000
    }
}

impl DomainSyncConfig {
    const fn default_refresh_interval_secs() -> u64 {
        60
    }

    const fn default_request_timeout_secs() -> u64 {
        10
    }
}

impl CorsConfig {
    fn default_origins() -> Vec<String> {
        vec![
            "https://shortid.me".to_string(),
            "http://localhost:3000".to_string(),
            "http://localhost:3003".to_string(),
        ]
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("{name} has an invalid value '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let host = env_or("HOST", "0.0.0.0");
        let port = env_parse::<u16>("PORT", 8080)?;

        let backend_str = env_or("STORE_BACKEND", "duckdb");
        let backend = match backend_str.to_lowercase().as_str() {
            "duckdb" => StoreBackend::DuckDb,
            "clickhouse" => StoreBackend::ClickHouse,
            other => {
                tracing::warn!(
                    "Unknown STORE_BACKEND '{other}', falling back to 'duckdb'. Supported values: duckdb, clickhouse"
                );
                StoreBackend::DuckDb
            }
        };

        let s3 = S3Config {
            endpoint: env_or("S3_ENDPOINT", ""),
            access_key: env_or("S3_KEY", ""),
            secret_key: env_or("S3_SECRET", ""),
            bucket: env_or("S3_BUCKET", ""),
            prefix: env_or("S3_PREFIX", ""),
            use_ssl: std::env::var("S3_USE_SSL")
                .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
                .unwrap_or_else(|_| S3Config::default_use_ssl()),
        };

        let duckdb = DuckDbConfig {
            threads: env_parse("DUCKDB_THREADS", DuckDbConfig::default_threads())?,
            memory_limit: env_or("DUCKDB_MEMORY_LIMIT", &DuckDbConfig::default_memory_limit()),
            refresh_interval_secs: env_parse(
                "DUCKDB_REFRESH_INTERVAL_SECS",
                DuckDbConfig::default_refresh_interval_secs(),
            )?,
            parquet_glob: env_non_empty("DUCKDB_PARQUET_GLOB"),
        };

        if backend == StoreBackend::DuckDb
            && duckdb.parquet_glob.is_none()
            && (s3.endpoint.is_empty() || s3.bucket.is_empty())
        {
            anyhow::bail!("S3_ENDPOINT and S3_BUCKET (or DUCKDB_PARQUET_GLOB) must be set when STORE_BACKEND=duckdb");
        }

        let clickhouse = ClickHouseConfig {
            url: env_or("CLICKHOUSE_URL", "http://localhost:8123"),
            database: env_or("CLICKHOUSE_DATABASE", "default"),
            user: env_non_empty("CLICKHOUSE_USER"),
            password: env_non_empty("CLICKHOUSE_PASSWORD"),
            sync_interval_secs: env_parse(
                "CLICKHOUSE_SYNC_INTERVAL_SECS",
                ClickHouseConfig::default_sync_interval_secs(),
            )?,
        };

        if backend == StoreBackend::ClickHouse && (s3.endpoint.is_empty() || s3.bucket.is_empty()) {
            anyhow::bail!("S3_ENDPOINT and S3_BUCKET must be set when STORE_BACKEND=clickhouse");
        }

        let cache = CacheConfig {
            ttl_secs: env_parse("CACHE_TTL_SECS", CacheConfig::default_ttl_secs())?,
        };

        let query = QueryConfig {
            timeout_ms: env_parse("QUERY_TIMEOUT_MS", QueryConfig::default_timeout_ms())?,
            default_domain: env_or("DEFAULT_DOMAIN", "shortid.me"),
        };

        let domain_sync = match (env_non_empty("STATS_URL"), env_non_empty("SYNC_SECRET")) {
            (Some(stats_url), Some(sync_secret)) => Some(DomainSyncConfig {
                stats_url,
                sync_secret,
                snapshot_path: PathBuf::from(env_or(
                    "DOMAIN_CACHE_FILE",
                    "/tmp/domain_cache.json",
                )),
                refresh_interval_secs: env_parse(
                    "DOMAIN_REFRESH_INTERVAL_SECS",
                    DomainSyncConfig::default_refresh_interval_secs(),
                )?,
                request_timeout_secs: env_parse(
                    "DOMAIN_REQUEST_TIMEOUT_SECS",
                    DomainSyncConfig::default_request_timeout_secs(),
                )?,
            }),
            (Some(_), None) | (None, Some(_)) => {
                tracing::warn!("STATS_URL and SYNC_SECRET must both be set; domain sync disabled");
                None
            }
            (None, None) => None,
        };

        let cors = CorsConfig {
            allowed_origins: env_non_empty("CORS_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|origin| origin.trim().to_string())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or_else(CorsConfig::default_origins),
        };

        Ok(Config {
            server: ServerConfig { host, port },
            store: StoreConfig {
                backend,
                s3,
                duckdb,
                clickhouse,
            },
            cache,
            query,
            domain_sync,
            cors,
        })
    }
}
