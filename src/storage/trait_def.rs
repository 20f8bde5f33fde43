use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::analytics::funnel::split_pageview_steps;
use crate::models::{
    AutocaptureEvent, EventItem, FunnelResult, FunnelStepDef, Interval, Overview,
    TimeSeriesPoint, TimeWindow, TopItem,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("DuckDB query failed: {0}")]
    DuckDb(#[from] duckdb::Error),
    #[error("ClickHouse query failed: {0}")]
    ClickHouse(#[from] clickhouse::error::Error),
    #[error("query task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Where queries are currently answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TableSource {
    /// In-memory table materialized from the object store
    Memory,
    /// Reading object storage directly
    Remote,
    /// Server-side replica table
    Replica,
    /// A refresh holds the table; state is reported after it finishes
    Refreshing,
}

#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    pub backend: &'static str,
    pub ready: bool,
    pub source: TableSource,
    pub last_refresh: Option<DateTime<Utc>>,
    pub rows: Option<u64>,
}

/// Read-only query surface over the event history.
///
/// Every query is scoped to one site and a half-open `[from, to)` window on
/// the event timestamp. Ranking queries return at most `limit` items sorted by
/// descending count; empty dimension values are reported as `Unknown`.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Stop background work. In-flight queries are allowed to finish.
    async fn close(&self) -> StoreResult<()>;

    /// Run one refresh (or sync) cycle now and return the resulting row count
    async fn refresh(&self) -> StoreResult<u64>;

    /// Whether queries reflect loaded data yet
    fn is_ready(&self) -> bool;

    async fn status(&self) -> StoreStatus;

    async fn get_overview(&self, domain: &str, window: TimeWindow) -> StoreResult<Overview>;

    /// Pageview counts per bucket, ordered by bucket; empty buckets are omitted
    async fn get_pageviews_time_series(
        &self,
        domain: &str,
        window: TimeWindow,
        interval: Interval,
    ) -> StoreResult<Vec<TimeSeriesPoint>>;

    async fn get_top_pages(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    /// Referrers folded to their registrable domain, same-site traffic as `Direct`
    async fn get_top_sources(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_browsers(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_countries(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_devices(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_utm_sources(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_utm_mediums(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    async fn get_top_utm_campaigns(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>>;

    /// Most recent events first
    async fn get_recent_events(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<EventItem>>;

    /// Top 10 event names
    async fn get_event_breakdown(&self, domain: &str, window: TimeWindow)
        -> StoreResult<Vec<TopItem>>;

    async fn get_unique_pages(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<TopItem>> {
        self.get_top_pages(domain, window, limit).await
    }

    /// Distinct visitors per pathname step, evaluated independently per step.
    ///
    /// Fewer than two steps yields a zeroed result.
    async fn get_funnel(
        &self,
        domain: &str,
        window: TimeWindow,
        steps: &[String],
    ) -> StoreResult<FunnelResult>;

    /// Funnel over typed steps. Only pageview steps are evaluated; the rest
    /// are returned in `excluded_steps`, and `window_minutes` is not applied.
    async fn get_funnel_advanced(
        &self,
        domain: &str,
        window: TimeWindow,
        steps: &[FunnelStepDef],
        window_minutes: i64,
    ) -> StoreResult<FunnelResult> {
        let (pageviews, excluded) = split_pageview_steps(steps);
        if !excluded.is_empty() {
            tracing::debug!(
                excluded = excluded.len(),
                window_minutes,
                "Advanced funnel evaluates pageview steps only"
            );
        }

        let mut result = self.get_funnel(domain, window, &pageviews).await?;
        result.excluded_steps = excluded;
        Ok(result)
    }

    async fn get_autocapture_events(
        &self,
        domain: &str,
        window: TimeWindow,
        limit: usize,
    ) -> StoreResult<Vec<AutocaptureEvent>>;
}
