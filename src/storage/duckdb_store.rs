//! Embedded DuckDB backend.
//!
//! Event batches live as Parquet files in object storage (or a local glob).
//! A background loop materializes them into an in-memory `events` table every
//! refresh interval. The drop/recreate runs under the write half of a
//! `tokio::sync::RwLock`; every query holds the read half until its blocking
//! task finishes, so readers never observe a half-built table.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};
use tokio::sync::{watch, RwLock};
use tokio::time;

use super::dimension::{
    Dimension, AUTOCAPTURE_EVENTS, DEFAULT_DEVICE, EVENT_BREAKDOWN_LIMIT, UNKNOWN,
};
use super::trait_def::{AnalyticsStore, StoreResult, StoreStatus, TableSource};
use crate::analytics::{build_funnel, empty_funnel, fold_sources, StepPattern};
use crate::config::{DuckDbConfig, S3Config};
use crate::models::{
    AutocaptureEvent, EventItem, FunnelResult, Interval, Overview, TimeSeriesPoint, TimeWindow,
    TopItem,
};

const TABLE_NAME: &str = "events";

const WINDOW_FILTER: &str =
    "domain = ? AND epoch_us(timestamp) >= ? AND epoch_us(timestamp) < ?";

/// Where the Parquet batches are read from
#[derive(Debug, Clone)]
pub enum ParquetLocation {
    S3(S3Config),
    Glob(String),
}

impl ParquetLocation {
    pub fn from_config(config: &DuckDbConfig, s3: &S3Config) -> Self {
        match &config.parquet_glob {
            Some(glob) => ParquetLocation::Glob(glob.clone()),
            None => ParquetLocation::S3(s3.clone()),
        }
    }

    pub fn glob(&self) -> String {
        match self {
            ParquetLocation::S3(s3) => format!("s3://{}/{}**/*.parquet", s3.bucket, s3.prefix),
            ParquetLocation::Glob(glob) => glob.clone(),
        }
    }

    /// Table expression that reads the batches directly
    fn read_expr(&self) -> String {
        format!(
            "read_parquet('{}', union_by_name = true)",
            escape_literal(&self.glob())
        )
    }

    /// Statements that give DuckDB access to the object store
    fn setup_sql(&self) -> Option<String> {
        match self {
            ParquetLocation::S3(s3) => Some(format!(
                "INSTALL httpfs;
                 LOAD httpfs;
                 SET GLOBAL s3_endpoint = '{}';
                 SET GLOBAL s3_access_key_id = '{}';
                 SET GLOBAL s3_secret_access_key = '{}';
                 SET GLOBAL s3_url_style = 'path';
                 SET GLOBAL s3_use_ssl = {};",
                escape_literal(&s3.endpoint),
                escape_literal(&s3.access_key),
                escape_literal(&s3.secret_key),
                s3.use_ssl,
            )),
            ParquetLocation::Glob(_) => None,
        }
    }
}

impl fmt::Display for ParquetLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.glob())
    }
}

fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

struct RefreshState {
    source: TableSource,
    last_refresh: Option<DateTime<Utc>>,
    rows: Option<u64>,
}

struct Inner {
    /// Template connection; every query and refresh works on a clone
    conn: Mutex<Connection>,
    state: Arc<RwLock<RefreshState>>,
    ready: AtomicBool,
    remote_configured: AtomicBool,
    location: ParquetLocation,
    refresh_interval: Duration,
}

pub struct DuckDbStore {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl DuckDbStore {
    /// Open an in-memory database. No data is loaded until the first refresh.
    pub fn connect(config: &DuckDbConfig, s3: &S3Config) -> anyhow::Result<Self> {
        let db_config = duckdb::Config::default()
            .threads(config.threads)
            .context("invalid DuckDB thread count")?
            .max_memory(&config.memory_limit)
            .context("invalid DuckDB memory limit")?;
        let conn = Connection::open_in_memory_with_flags(db_config)
            .context("failed to open DuckDB")?;

        let location = ParquetLocation::from_config(config, s3);
        tracing::info!(
            "DuckDB opened (threads={}, memory_limit={}), source {}",
            config.threads,
            config.memory_limit,
            location
        );

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            inner: Arc::new(Inner {
                conn: Mutex::new(conn),
                state: Arc::new(RwLock::new(RefreshState {
                    source: TableSource::Remote,
                    last_refresh: None,
                    rows: None,
                })),
                ready: AtomicBool::new(false),
                remote_configured: AtomicBool::new(false),
                location,
                refresh_interval: Duration::from_secs(config.refresh_interval_secs.max(1)),
            }),
            shutdown_tx,
        })
    }

    /// Start the periodic refresh. The first cycle runs immediately.
    pub fn spawn_refresh_loop(&self) {
        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut interval = time::interval(inner.refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = inner.refresh_cycle().await {
                            tracing::warn!("DuckDB refresh failed, serving from {}: {}", inner.location, e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("DuckDB refresh loop stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Configure remote access if needed and materialize once
    pub async fn refresh_now(&self) -> StoreResult<u64> {
        self.inner.refresh_cycle().await
    }

    async fn top_by(
        &self,
        domain: &str,
        window: TimeWindow,
        dimension: Dimension,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let domain = domain.to_string();
        let column = dimension.column();
        let event_filter = if dimension.pageviews_only() {
            " AND name = 'pageview'"
        } else {
            ""
        };

        self.inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT COALESCE(NULLIF({column}, ''), '{UNKNOWN}') AS label, COUNT(*) AS count
                     FROM {table}
                     WHERE {WINDOW_FILTER}{event_filter}
                     GROUP BY label
                     ORDER BY count DESC, label
                     LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for row in stmt.query_map(
                    params![domain, window.from_micros(), window.to_micros(), limit as i64],
                    |row| {
                        Ok(TopItem {
                            name: row.get(0)?,
                            count: row.get(1)?,
                        })
                    },
                )? {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }
}

impl Inner {
    fn clone_connection(&self) -> StoreResult<Connection> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(conn.try_clone()?)
    }

    /// Run `query` on a blocking thread against the current table source.
    ///
    /// The read guard moves into the blocking task, so it is released only
    /// when the query has actually finished, even if the caller gave up.
    async fn with_reader<T, F>(&self, query: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &str) -> duckdb::Result<T> + Send + 'static,
    {
        let guard = Arc::clone(&self.state).read_owned().await;
        let table = match guard.source {
            TableSource::Memory => TABLE_NAME.to_string(),
            _ => self.location.read_expr(),
        };
        let conn = self.clone_connection()?;

        let result = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            query(&conn, &table)
        })
        .await??;

        Ok(result)
    }

    async fn refresh_cycle(&self) -> StoreResult<u64> {
        self.ensure_remote_access().await?;
        self.materialize().await
    }

    async fn ensure_remote_access(&self) -> StoreResult<()> {
        if self.remote_configured.load(Ordering::Acquire) {
            return Ok(());
        }

        if let Some(sql) = self.location.setup_sql() {
            tracing::info!("Configuring DuckDB object storage access");
            let conn = self.clone_connection()?;
            tokio::task::spawn_blocking(move || conn.execute_batch(&sql))
                .await?
                .context("failed to configure object storage access")?;
        }

        self.remote_configured.store(true, Ordering::Release);
        Ok(())
    }

    async fn materialize(&self) -> StoreResult<u64> {
        let mut state = self.state.write().await;
        let conn = self.clone_connection()?;
        let source = self.location.read_expr();
        let started = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || -> duckdb::Result<i64> {
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS {TABLE_NAME};
                 CREATE TABLE {TABLE_NAME} AS SELECT * FROM {source};"
            ))?;
            conn.query_row(&format!("SELECT COUNT(*) FROM {TABLE_NAME}"), [], |row| {
                row.get(0)
            })
        })
        .await;

        match outcome {
            Ok(Ok(rows)) => {
                let rows = rows.max(0) as u64;
                state.source = TableSource::Memory;
                state.rows = Some(rows);
                state.last_refresh = Some(Utc::now());
                self.ready.store(true, Ordering::Release);
                tracing::info!(
                    rows,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "DuckDB events table refreshed"
                );
                Ok(rows)
            }
            Ok(Err(e)) => {
                state.source = TableSource::Remote;
                Err(e.into())
            }
            Err(e) => {
                state.source = TableSource::Remote;
                Err(e.into())
            }
        }
    }
}

fn micros_to_datetime(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

#[async_trait]
impl AnalyticsStore for DuckDbStore {
    async fn close(&self) -> StoreResult<()> {
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    async fn refresh(&self) -> StoreResult<u64> {
        self.refresh_now().await
    }

    fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    async fn status(&self) -> StoreStatus {
        let ready = self.is_ready();
        match self.inner.state.try_read() {
            Ok(state) => StoreStatus {
                backend: "duckdb",
                ready,
                source: state.source,
                last_refresh: state.last_refresh,
                rows: state.rows,
            },
            Err(_) => StoreStatus {
                backend: "duckdb",
                ready,
                source: TableSource::Refreshing,
                last_refresh: None,
                rows: None,
            },
        }
    }

    async fn get_overview(&self, domain: &str, window: TimeWindow) -> StoreResult<Overview> {
        if !self.is_ready() {
            return Ok(Overview::default());
        }

        let domain = domain.to_string();
        self.inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT
                        COUNT(*) FILTER (WHERE name = 'pageview'),
                        COUNT(DISTINCT visitor_id),
                        COUNT(*)
                     FROM {table}
                     WHERE {WINDOW_FILTER}"
                );
                conn.query_row(
                    &sql,
                    params![domain, window.from_micros(), window.to_micros()],
                    |row| {
                        Ok(Overview {
                            pageviews: row.get(0)?,
                            unique_visitors: row.get(1)?,
                            events: row.get(2)?,
                        })
                    },
                )
            })
            .await
    }

    async fn get_pageviews_time_series(
        &self,
        domain: &str,
        window: TimeWindow,
        interval: Interval,
    ) -> StoreResult<Vec<TimeSeriesPoint>> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let domain = domain.to_string();
        let width = interval.micros();
        let buckets = self
            .inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT (epoch_us(timestamp) // {width}) * {width} AS bucket, COUNT(*)
                     FROM {table}
                     WHERE {WINDOW_FILTER} AND name = 'pageview'
                     GROUP BY bucket
                     ORDER BY bucket"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for row in stmt.query_map(
                    params![domain, window.from_micros(), window.to_micros()],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
                )? {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        Ok(buckets
            .into_iter()
            .filter_map(|(bucket, value)| {
                micros_to_datetime(bucket).map(|start| TimeSeriesPoint {
                    time: interval.format_bucket(start),
                    value,
                })
            })
            .collect())
    }

    async fn get_top_pages(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::Pathname, limit).await
    }

    async fn get_top_sources(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let site = domain.to_string();
        let referrers = self
            .inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT COALESCE(referrer, '') AS referrer, COUNT(*)
                     FROM {table}
                     WHERE {WINDOW_FILTER} AND name = 'pageview'
                     GROUP BY 1"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for row in stmt.query_map(
                    params![site, window.from_micros(), window.to_micros()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )? {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        Ok(fold_sources(referrers, domain, limit))
    }

    async fn get_top_browsers(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::Browser, limit).await
    }

    async fn get_top_countries(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::Country, limit).await
    }

    async fn get_top_devices(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::Device, limit).await
    }

    async fn get_top_utm_sources(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::UtmSource, limit).await
    }

    async fn get_top_utm_mediums(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::UtmMedium, limit).await
    }

    async fn get_top_utm_campaigns(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::UtmCampaign, limit).await
    }

    async fn get_recent_events(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<EventItem>> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let domain = domain.to_string();
        self.inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT
                        name,
                        COALESCE(url, ''),
                        COALESCE(pathname, ''),
                        COALESCE(NULLIF(country, ''), '{UNKNOWN}'),
                        COALESCE(NULLIF(browser, ''), '{UNKNOWN}'),
                        COALESCE(NULLIF(os, ''), '{UNKNOWN}'),
                        COALESCE(NULLIF(device, ''), '{DEFAULT_DEVICE}'),
                        epoch_us(timestamp),
                        COALESCE(props, '')
                     FROM {table}
                     WHERE {WINDOW_FILTER}
                     ORDER BY timestamp DESC
                     LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for row in stmt.query_map(
                    params![domain, window.from_micros(), window.to_micros(), limit as i64],
                    |row| {
                        let micros: i64 = row.get(7)?;
                        Ok(EventItem {
                            name: row.get(0)?,
                            url: row.get(1)?,
                            pathname: row.get(2)?,
                            country: row.get(3)?,
                            browser: row.get(4)?,
                            os: row.get(5)?,
                            device: row.get(6)?,
                            timestamp: micros_to_datetime(micros)
                                .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                                .unwrap_or_default(),
                            props: row.get(8)?,
                        })
                    },
                )? {
                    out.push(row?);
                }
                Ok(out)
            })
            .await
    }

    async fn get_event_breakdown(
        &self,
        domain: &str,
        window: TimeWindow,
    ) -> StoreResult<Vec<TopItem>> {
        self.top_by(domain, window, Dimension::EventName, EVENT_BREAKDOWN_LIMIT)
            .await
    }

    async fn get_funnel(
        &self,
        domain: &str,
        window: TimeWindow,
        steps: &[String],
    ) -> StoreResult<FunnelResult> {
        if steps.len() < 2 || !self.is_ready() {
            return Ok(empty_funnel(steps));
        }

        let domain = domain.to_string();
        let step_list = steps.to_vec();
        let counts = self
            .inner
            .with_reader(move |conn, table| {
                let base = format!(
                    "SELECT COUNT(DISTINCT visitor_id)
                     FROM {table}
                     WHERE {WINDOW_FILTER} AND name = 'pageview' AND "
                );
                let (from, to) = (window.from_micros(), window.to_micros());

                let mut counts = Vec::with_capacity(step_list.len());
                for step in &step_list {
                    let count: i64 = match StepPattern::parse(step) {
                        StepPattern::Exact(path) => conn.query_row(
                            &format!("{base}pathname = ?"),
                            params![domain, from, to, path],
                            |row| row.get(0),
                        )?,
                        StepPattern::Prefix(prefix) => conn.query_row(
                            &format!("{base}starts_with(pathname, ?) AND pathname <> ?"),
                            params![domain, from, to, prefix, prefix],
                            |row| row.get(0),
                        )?,
                    };
                    counts.push(count);
                }
                Ok(counts)
            })
            .await?;

        Ok(build_funnel(steps, &counts))
    }

    async fn get_autocapture_events(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<AutocaptureEvent>> {
        if !self.is_ready() {
            return Ok(Vec::new());
        }

        let domain = domain.to_string();
        let names = AUTOCAPTURE_EVENTS
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = self
            .inner
            .with_reader(move |conn, table| {
                let sql = format!(
                    "SELECT
                        name,
                        COALESCE(CASE WHEN json_valid(props) THEN json_extract_string(props, '$.text') END, '') AS text,
                        COALESCE(CASE WHEN json_valid(props) THEN json_extract_string(props, '$.tag') END, '') AS tag,
                        COALESCE(pathname, '') AS path,
                        COUNT(*) AS count
                     FROM {table}
                     WHERE {WINDOW_FILTER} AND name IN ({names})
                     GROUP BY 1, 2, 3, 4
                     ORDER BY count DESC, 1, 2, 3, 4
                     LIMIT ?"
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut out = Vec::new();
                for row in stmt.query_map(
                    params![domain, window.from_micros(), window.to_micros(), limit as i64],
                    |row| {
                        Ok(AutocaptureEvent {
                            event_type: row.get(0)?,
                            text: row.get(1)?,
                            tag: row.get(2)?,
                            pathname: row.get(3)?,
                            count: row.get(4)?,
                        })
                    },
                )? {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;

        Ok(rows)
    }
}

impl Drop for DuckDbStore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}
