//! ClickHouse replica backend
//!
//! Keeps a server-side `events` table that is truncated and reloaded from the
//! Parquet batches in object storage on every sync. Syncs exclude each other;
//! queries do not wait for them and can see a partially loaded table while a
//! reload is in progress.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clickhouse::{Client, Row};
use serde::Deserialize;
use tokio::sync::{watch, Mutex as AsyncMutex, RwLock};
use tokio::time;

use super::dimension::{
    Dimension, AUTOCAPTURE_EVENTS, DEFAULT_DEVICE, EVENT_BREAKDOWN_LIMIT, UNKNOWN,
};
use super::trait_def::{AnalyticsStore, StoreResult, StoreStatus, TableSource};
use crate::analytics::{build_funnel, empty_funnel, fold_sources, StepPattern};
use crate::config::{ClickHouseConfig, S3Config};
use crate::models::{
    AutocaptureEvent, EventItem, FunnelResult, Interval, Overview, TimeSeriesPoint, TimeWindow,
    TopItem,
};

const TABLE_NAME: &str = "events";

const TABLE_ENGINE: &str = "\
ReplacingMergeTree() \
PARTITION BY toYYYYMM(timestamp) \
ORDER BY (domain, timestamp, visitor_id, name, pathname) \
TTL toDate(timestamp) + INTERVAL 1 YEAR \
SETTINGS index_granularity = 8192";

const WINDOW_FILTER: &str = "domain = ? \
AND timestamp >= fromUnixTimestamp64Micro(toInt64(?)) \
AND timestamp < fromUnixTimestamp64Micro(toInt64(?))";

#[derive(Debug, Row, Deserialize)]
struct CountRow {
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct OverviewRow {
    pageviews: u64,
    unique_visitors: u64,
    events: u64,
}

#[derive(Debug, Row, Deserialize)]
struct BucketRow {
    bucket: i64,
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct LabelRow {
    label: String,
    count: u64,
}

#[derive(Debug, Row, Deserialize)]
struct EventRow {
    name: String,
    url: String,
    pathname: String,
    country: String,
    browser: String,
    os: String,
    device: String,
    ts: i64,
    props: String,
}

#[derive(Debug, Row, Deserialize)]
struct AutocaptureRow {
    event_type: String,
    text: String,
    tag: String,
    pathname: String,
    count: u64,
}

#[derive(Debug, Default)]
struct SyncRecord {
    last_sync: Option<DateTime<Utc>>,
    rows: Option<u64>,
}

struct Inner {
    client: Client,
    s3_url: String,
    s3_access_key: String,
    s3_secret_key: String,
    sync_lock: AsyncMutex<()>,
    record: RwLock<SyncRecord>,
    sync_interval: Duration,
}

pub struct ClickHouseStore {
    inner: Arc<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

/// HTTPS location of the Parquet batches as seen by the ClickHouse server
pub fn s3_url(s3: &S3Config) -> String {
    let scheme = if s3.use_ssl { "https" } else { "http" };
    format!(
        "{scheme}://{}/{}/{}**/*.parquet",
        s3.endpoint.trim_end_matches('/'),
        s3.bucket,
        s3.prefix
    )
}

fn create_table_sql() -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {TABLE_NAME} (
            domain LowCardinality(String),
            visitor_id String,
            session_id String DEFAULT '',
            name LowCardinality(String),
            url String DEFAULT '',
            pathname String DEFAULT '',
            referrer String DEFAULT '',
            utm_source LowCardinality(String) DEFAULT '',
            utm_medium LowCardinality(String) DEFAULT '',
            utm_campaign LowCardinality(String) DEFAULT '',
            utm_term String DEFAULT '',
            utm_content String DEFAULT '',
            timestamp DateTime64(6, 'UTC'),
            received_at DateTime64(6, 'UTC'),
            browser LowCardinality(String) DEFAULT '',
            browser_version String DEFAULT '',
            os LowCardinality(String) DEFAULT '',
            os_version String DEFAULT '',
            device LowCardinality(String) DEFAULT '',
            country LowCardinality(String) DEFAULT '',
            city String DEFAULT '',
            props String DEFAULT '{{}}'
        ) ENGINE = {TABLE_ENGINE}"
    )
}

fn top_by_sql(dimension: Dimension) -> String {
    let column = dimension.column();
    let event_filter = if dimension.pageviews_only() {
        " AND name = 'pageview'"
    } else {
        ""
    };
    format!(
        "SELECT if({column} = '', '{UNKNOWN}', toString({column})) AS label, count() AS count
         FROM {TABLE_NAME}
         WHERE {WINDOW_FILTER}{event_filter}
         GROUP BY label
         ORDER BY count DESC, label
         LIMIT ?"
    )
}

fn funnel_step_sql(pattern: StepPattern<'_>) -> String {
    let predicate = match pattern {
        StepPattern::Exact(_) => "pathname = ?",
        StepPattern::Prefix(_) => "startsWith(pathname, ?) AND pathname != ?",
    };
    format!(
        "SELECT uniqExact(visitor_id) AS count
         FROM {TABLE_NAME}
         WHERE {WINDOW_FILTER} AND name = 'pageview' AND {predicate}"
    )
}

impl ClickHouseStore {
    /// Build the client and make sure the replica table exists
    pub async fn connect(config: &ClickHouseConfig, s3: &S3Config) -> anyhow::Result<Self> {
        let mut client = Client::default()
            .with_url(&config.url)
            .with_database(&config.database)
            .with_option("connect_timeout", "10");
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }

        let (shutdown_tx, _) = watch::channel(false);
        let store = Self {
            inner: Arc::new(Inner {
                client,
                s3_url: s3_url(s3),
                s3_access_key: s3.access_key.clone(),
                s3_secret_key: s3.secret_key.clone(),
                sync_lock: AsyncMutex::new(()),
                record: RwLock::new(SyncRecord::default()),
                sync_interval: Duration::from_secs(config.sync_interval_secs.max(1)),
            }),
            shutdown_tx,
        };

        store.ensure_table().await?;
        tracing::info!("ClickHouse connected at {} ({})", config.url, config.database);
        Ok(store)
    }

    async fn ensure_table(&self) -> anyhow::Result<()> {
        self.inner
            .client
            .query(&create_table_sql())
            .execute()
            .await
            .context("Create ClickHouse events table")?;
        Ok(())
    }

    /// Run the initial sync, then keep syncing in the background until closed
    pub async fn start(&self) {
        if let Err(e) = self.inner.sync_from_s3().await {
            tracing::warn!("Initial ClickHouse sync failed: {}", e);
        }

        let inner = Arc::clone(&self.inner);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut interval = time::interval(inner.sync_interval);
            // Initial sync already ran
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = inner.sync_from_s3().await {
                            tracing::warn!("ClickHouse sync failed: {}", e);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            tracing::info!("ClickHouse sync loop stopped");
                            break;
                        }
                    }
                }
            }
        });
    }

    /// Truncate and reload the replica now
    pub async fn sync_now(&self) -> StoreResult<u64> {
        self.inner.sync_from_s3().await
    }

    async fn top_by(
        &self,
        domain: &str,
        window: TimeWindow,
        dimension: Dimension,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        let rows = self
            .inner
            .client
            .query(&top_by_sql(dimension))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .bind(limit as u64)
            .fetch_all::<LabelRow>()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| TopItem {
                name: row.label,
                count: row.count as i64,
            })
            .collect())
    }
}

impl Inner {
    async fn sync_from_s3(&self) -> StoreResult<u64> {
        let _guard = self.sync_lock.lock().await;
        let started = Instant::now();
        tracing::info!("Syncing ClickHouse events from {}", self.s3_url);

        self.client
            .query(&format!("TRUNCATE TABLE {TABLE_NAME}"))
            .execute()
            .await
            .context("Truncate ClickHouse events table")?;

        self.client
            .query(&format!(
                "INSERT INTO {TABLE_NAME} SELECT * FROM s3(?, ?, ?, 'Parquet')"
            ))
            .bind(self.s3_url.as_str())
            .bind(self.s3_access_key.as_str())
            .bind(self.s3_secret_key.as_str())
            .execute()
            .await
            .context("Load events from object storage")?;

        let rows = self
            .client
            .query(&format!("SELECT count() AS count FROM {TABLE_NAME}"))
            .fetch_one::<CountRow>()
            .await?
            .count;

        let mut record = self.record.write().await;
        record.last_sync = Some(Utc::now());
        record.rows = Some(rows);

        tracing::info!(
            rows,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ClickHouse sync complete"
        );
        Ok(rows)
    }
}

#[async_trait]
impl AnalyticsStore for ClickHouseStore {
    async fn close(&self) -> StoreResult<()> {
        let _ = self.shutdown_tx.send(true);
        Ok(())
    }

    async fn refresh(&self) -> StoreResult<u64> {
        self.sync_now().await
    }

    fn is_ready(&self) -> bool {
        true
    }

    async fn status(&self) -> StoreStatus {
        let record = self.inner.record.read().await;
        StoreStatus {
            backend: "clickhouse",
            ready: true,
            source: TableSource::Replica,
            last_refresh: record.last_sync,
            rows: record.rows,
        }
    }

    async fn get_overview(&self, domain: &str, window: TimeWindow) -> StoreResult<Overview> {
        let row = self
            .inner
            .client
            .query(&format!(
                "SELECT
                    countIf(name = 'pageview') AS pageviews,
                    uniqExact(visitor_id) AS unique_visitors,
                    count() AS events
                 FROM {TABLE_NAME}
                 WHERE {WINDOW_FILTER}"
            ))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .fetch_one::<OverviewRow>()
            .await?;

        Ok(Overview {
            pageviews: row.pageviews as i64,
            unique_visitors: row.unique_visitors as i64,
            events: row.events as i64,
        })
    }

    async fn get_pageviews_time_series(
        &self,
        domain: &str,
        window: TimeWindow,
        interval: Interval,
    ) -> StoreResult<Vec<TimeSeriesPoint>> {
        let width = interval.micros();
        let rows = self
            .inner
            .client
            .query(&format!(
                "SELECT toInt64(intDiv(toUnixTimestamp64Micro(timestamp), {width}) * {width}) AS bucket, count() AS count
                 FROM {TABLE_NAME}
                 WHERE {WINDOW_FILTER} AND name = 'pageview'
                 GROUP BY bucket
                 ORDER BY bucket"
            ))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .fetch_all::<BucketRow>()
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| {
                DateTime::from_timestamp_micros(row.bucket).map(|start| TimeSeriesPoint {
                    time: interval.format_bucket(start),
                    value: row.count as i64,
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
        let rows = self
            .inner
            .client
            .query(&format!(
                "SELECT referrer AS label, count() AS count
                 FROM {TABLE_NAME}
                 WHERE {WINDOW_FILTER} AND name = 'pageview'
                 GROUP BY label"
            ))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .fetch_all::<LabelRow>()
            .await?;

        Ok(fold_sources(
            rows.into_iter().map(|row| (row.label, row.count as i64)),
            domain,
            limit,
        ))
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
        let rows = self
            .inner
            .client
            .query(&format!(
                "SELECT
                    toString(name) AS name,
                    url,
                    pathname,
                    if(country = '', '{UNKNOWN}', toString(country)) AS country,
                    if(browser = '', '{UNKNOWN}', toString(browser)) AS browser,
                    if(os = '', '{UNKNOWN}', toString(os)) AS os,
                    if(device = '', '{DEFAULT_DEVICE}', toString(device)) AS device,
                    toUnixTimestamp64Micro(timestamp) AS ts,
                    props
                 FROM {TABLE_NAME}
                 WHERE {WINDOW_FILTER}
                 ORDER BY timestamp DESC
                 LIMIT ?"
            ))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .bind(limit as u64)
            .fetch_all::<EventRow>()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| EventItem {
                name: row.name,
                url: row.url,
                pathname: row.pathname,
                country: row.country,
                browser: row.browser,
                os: row.os,
                device: row.device,
                timestamp: DateTime::from_timestamp_micros(row.ts)
                    .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default(),
                props: row.props,
            })
            .collect())
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
        if steps.len() < 2 {
            return Ok(empty_funnel(steps));
        }

        let mut counts = Vec::with_capacity(steps.len());
        for step in steps {
            let pattern = StepPattern::parse(step);
            let mut query = self
                .inner
                .client
                .query(&funnel_step_sql(pattern))
                .bind(domain)
                .bind(window.from_micros())
                .bind(window.to_micros());
            query = match pattern {
                StepPattern::Exact(path) => query.bind(path),
                StepPattern::Prefix(prefix) => query.bind(prefix).bind(prefix),
            };
            let row = query.fetch_one::<CountRow>().await?;
            counts.push(row.count as i64);
        }

        Ok(build_funnel(steps, &counts))
    }

    async fn get_autocapture_events(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<AutocaptureEvent>> {
        let names = AUTOCAPTURE_EVENTS
            .iter()
            .map(|name| format!("'{name}'"))
            .collect::<Vec<_>>()
            .join(", ");

        let rows = self
            .inner
            .client
            .query(&format!(
                "SELECT
                    toString(name) AS event_type,
                    JSONExtractString(props, 'text') AS text,
                    JSONExtractString(props, 'tag') AS tag,
                    pathname,
                    count() AS count
                 FROM {TABLE_NAME}
                 WHERE {WINDOW_FILTER} AND name IN ({names})
                 GROUP BY event_type, text, tag, pathname
                 ORDER BY count DESC, event_type, text, tag, pathname
                 LIMIT ?"
            ))
            .bind(domain)
            .bind(window.from_micros())
            .bind(window.to_micros())
            .bind(limit as u64)
            .fetch_all::<AutocaptureRow>()
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| AutocaptureEvent {
                event_type: row.event_type,
                text: row.text,
                tag: row.tag,
                pathname: row.pathname,
                count: row.count as i64,
            })
            .collect())
    }
}

impl Drop for ClickHouseStore {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_url() {
        let s3 = S3Config {
            endpoint: "minio.local:9000/".to_string(),
            bucket: "analytics".to_string(),
            prefix: "events/".to_string(),
            use_ssl: true,
            ..S3Config::default()
        };
        assert_eq!(
            s3_url(&s3),
            "https://minio.local:9000/analytics/events/**/*.parquet"
        );

        let plain = S3Config {
            use_ssl: false,
            ..s3
        };
        assert!(s3_url(&plain).starts_with("http://"));
    }

    #[test]
    fn test_table_definition() {
        let ddl = create_table_sql();
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS events"));
        assert!(ddl.contains("ReplacingMergeTree()"));
        assert!(ddl.contains("props String DEFAULT '{}'"));
        assert!(ddl.contains("TTL toDate(timestamp) + INTERVAL 1 YEAR"));
    }

    #[test]
    fn test_top_by_sql_filters_pageviews_for_pages_only() {
        let pages = top_by_sql(Dimension::Pathname);
        assert!(pages.contains("name = 'pageview'"));
        assert!(pages.contains("if(pathname = '', 'Unknown'"));

        let browsers = top_by_sql(Dimension::Browser);
        assert!(!browsers.contains("name = 'pageview'"));
    }

    #[test]
    fn test_funnel_step_sql() {
        assert!(funnel_step_sql(StepPattern::parse("/pricing")).ends_with("pathname = ?"));
        assert!(funnel_step_sql(StepPattern::parse("/docs/*"))
            .ends_with("startsWith(pathname, ?) AND pathname != ?"));
    }
}
