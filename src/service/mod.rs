//! Request-level orchestration over an [`AnalyticsStore`].
//!
//! Resolves request parameters, serves repeated queries from the TTL cache,
//! and bounds every store call with a deadline. Results computed while the
//! store is not ready yet, and errors, are never cached.

pub mod params;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analytics::funnel::DEFAULT_WINDOW_MINUTES;
use crate::cache::TtlCache;
use crate::config::QueryConfig;
use crate::models::{
    AutocaptureEvent, EventItem, FunnelResult, Overview, TimeSeriesPoint, TimeWindow, TopItem,
};
use crate::storage::{AnalyticsStore, StoreError, StoreResult, StoreStatus};

pub use params::{parse_limit, split_steps, FunnelAdvancedRequest, Period, StatsParams};

const DEFAULT_TOP_LIMIT: usize = 10;
const DEFAULT_EVENTS_LIMIT: usize = 50;
const DEFAULT_UNIQUE_PAGES_LIMIT: usize = 100;
const DEFAULT_AUTOCAPTURE_LIMIT: usize = 100;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("query exceeded the {0:?} deadline")]
    Timeout(Duration),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type QueryResult<T> = Result<T, QueryError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageviewSeries {
    pub interval: String,
    pub points: Vec<TimeSeriesPoint>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBreakdown {
    pub browsers: Vec<TopItem>,
    pub devices: Vec<TopItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UtmBreakdown {
    pub sources: Vec<TopItem>,
    pub mediums: Vec<TopItem>,
    pub campaigns: Vec<TopItem>,
}

/// Parameters after defaults are applied
#[derive(Debug, Clone)]
struct ResolvedQuery {
    domain: String,
    period: Period,
    window: TimeWindow,
}

impl ResolvedQuery {
    fn cache_key(&self, kind: &str, extra: &[&str]) -> String {
        let mut key = format!("{kind}:{}:{}", self.domain, self.period.token());
        for part in extra {
            key.push(':');
            key.push_str(part);
        }
        key
    }
}

pub struct StatsService {
    store: Arc<dyn AnalyticsStore>,
    cache: Arc<TtlCache>,
    query_timeout: Duration,
    default_domain: String,
}

impl StatsService {
    pub fn new(store: Arc<dyn AnalyticsStore>, cache: Arc<TtlCache>, config: &QueryConfig) -> Self {
        Self {
            store,
            cache,
            query_timeout: Duration::from_millis(config.timeout_ms.max(1)),
            default_domain: config.default_domain.clone(),
        }
    }

    pub async fn store_status(&self) -> StoreStatus {
        self.store.status().await
    }

    fn resolve(&self, params: &StatsParams) -> ResolvedQuery {
        let domain = params
            .domain
            .as_deref()
            .map(str::trim)
            .filter(|domain| !domain.is_empty())
            .unwrap_or(&self.default_domain)
            .to_string();
        let period = Period::parse(params.period.as_deref());

        ResolvedQuery {
            domain,
            window: period.window(Utc::now()),
            period,
        }
    }

    /// Serve `key` from cache, or run `fetch` under the deadline and cache the result
    async fn cached<T, F, Fut>(&self, key: String, fetch: F) -> QueryResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        if let Some(hit) = self.cache.get::<T>(&key) {
            tracing::debug!(key = %key, "Cache hit");
            return Ok(hit);
        }

        let ready = self.store.is_ready();
        let value = tokio::time::timeout(self.query_timeout, fetch())
            .await
            .map_err(|_| QueryError::Timeout(self.query_timeout))??;

        if ready {
            self.cache.set(&key, &value);
        }
        Ok(value)
    }

    pub async fn overview(&self, params: &StatsParams) -> QueryResult<Overview> {
        let q = self.resolve(params);
        self.cached(q.cache_key("overview", &[]), || {
            self.store.get_overview(&q.domain, q.window)
        })
        .await
    }

    pub async fn pageviews(&self, params: &StatsParams) -> QueryResult<PageviewSeries> {
        let q = self.resolve(params);
        let interval = q.window.interval();
        self.cached(q.cache_key("pageviews", &[]), || async {
            let points = self
                .store
                .get_pageviews_time_series(&q.domain, q.window, interval)
                .await?;
            Ok::<_, StoreError>(PageviewSeries {
                interval: interval.as_str().to_string(),
                points,
            })
        })
        .await
    }

    pub async fn top_pages(&self, params: &StatsParams) -> QueryResult<Vec<TopItem>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOP_LIMIT);
        self.cached(q.cache_key("pages", &[limit.to_string().as_str()]), || {
            self.store.get_top_pages(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn top_sources(&self, params: &StatsParams) -> QueryResult<Vec<TopItem>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOP_LIMIT);
        self.cached(q.cache_key("sources", &[limit.to_string().as_str()]), || {
            self.store.get_top_sources(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn devices(&self, params: &StatsParams) -> QueryResult<DeviceBreakdown> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOP_LIMIT);
        self.cached(q.cache_key("devices", &[limit.to_string().as_str()]), || async {
            Ok::<_, StoreError>(DeviceBreakdown {
                browsers: self.store.get_top_browsers(&q.domain, q.window, limit).await?,
                devices: self.store.get_top_devices(&q.domain, q.window, limit).await?,
            })
        })
        .await
    }

    pub async fn geo(&self, params: &StatsParams) -> QueryResult<Vec<TopItem>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOP_LIMIT);
        self.cached(q.cache_key("geo", &[limit.to_string().as_str()]), || {
            self.store.get_top_countries(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn utm(&self, params: &StatsParams) -> QueryResult<UtmBreakdown> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_TOP_LIMIT);
        self.cached(q.cache_key("utm", &[limit.to_string().as_str()]), || async {
            Ok::<_, StoreError>(UtmBreakdown {
                sources: self.store.get_top_utm_sources(&q.domain, q.window, limit).await?,
                mediums: self.store.get_top_utm_mediums(&q.domain, q.window, limit).await?,
                campaigns: self
                    .store
                    .get_top_utm_campaigns(&q.domain, q.window, limit)
                    .await?,
            })
        })
        .await
    }

    pub async fn recent_events(&self, params: &StatsParams) -> QueryResult<Vec<EventItem>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_EVENTS_LIMIT);
        self.cached(q.cache_key("events", &[limit.to_string().as_str()]), || {
            self.store.get_recent_events(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn event_breakdown(&self, params: &StatsParams) -> QueryResult<Vec<TopItem>> {
        let q = self.resolve(params);
        self.cached(q.cache_key("event-breakdown", &[]), || {
            self.store.get_event_breakdown(&q.domain, q.window)
        })
        .await
    }

    pub async fn unique_pages(&self, params: &StatsParams) -> QueryResult<Vec<TopItem>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_UNIQUE_PAGES_LIMIT);
        self.cached(q.cache_key("unique-pages", &[limit.to_string().as_str()]), || {
            self.store.get_unique_pages(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn autocapture_events(
        &self,
        params: &StatsParams,
    ) -> QueryResult<Vec<AutocaptureEvent>> {
        let q = self.resolve(params);
        let limit = parse_limit(params.limit.as_deref(), DEFAULT_AUTOCAPTURE_LIMIT);
        self.cached(q.cache_key("autocapture", &[limit.to_string().as_str()]), || {
            self.store.get_autocapture_events(&q.domain, q.window, limit)
        })
        .await
    }

    pub async fn funnel(&self, params: &StatsParams) -> QueryResult<FunnelResult> {
        let q = self.resolve(params);
        let raw = params
            .steps
            .as_deref()
            .filter(|steps| !steps.is_empty())
            .unwrap_or(params::DEFAULT_FUNNEL_STEPS);
        let steps = split_steps(raw);
        if steps.len() < 2 {
            return Err(QueryError::InvalidRequest(
                "funnel requires at least 2 steps".to_string(),
            ));
        }

        let joined = steps.join(",");
        self.cached(q.cache_key("funnel", &[&joined]), || {
            self.store.get_funnel(&q.domain, q.window, &steps)
        })
        .await
    }

    pub async fn funnel_advanced(
        &self,
        params: &StatsParams,
        request: &FunnelAdvancedRequest,
    ) -> QueryResult<FunnelResult> {
        if request.steps.len() < 2 {
            return Err(QueryError::InvalidRequest(
                "funnel requires at least 2 steps".to_string(),
            ));
        }

        let q = self.resolve(params);
        let window_minutes = if request.window <= 0 {
            DEFAULT_WINDOW_MINUTES
        } else {
            request.window
        };
        let steps_key = serde_json::to_string(&request.steps)
            .map_err(|e| QueryError::InvalidRequest(format!("invalid funnel steps: {e}")))?;

        self.cached(
            q.cache_key(
                "funnel-advanced",
                &[window_minutes.to_string().as_str(), steps_key.as_str()],
            ),
            || {
                self.store
                    .get_funnel_advanced(&q.domain, q.window, &request.steps, window_minutes)
            },
        )
        .await
    }
}
