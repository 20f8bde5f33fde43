use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::auth::DomainCache;
use crate::models::{AutocaptureEvent, EventItem, FunnelResult, Overview, TopItem};
use crate::service::{
    DeviceBreakdown, FunnelAdvancedRequest, PageviewSeries, QueryError, StatsParams,
    StatsService, UtmBreakdown,
};
use crate::storage::StoreStatus;

pub struct AppState {
    pub service: Arc<StatsService>,
    /// Absent when domain sync is not configured
    pub domains: Option<Arc<DomainCache>>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);
type HandlerResult<T> = Result<Json<T>, HandlerError>;

fn error_response(status: StatusCode, message: impl Into<String>) -> HandlerError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn query_error(err: QueryError) -> HandlerError {
    match err {
        QueryError::InvalidRequest(message) => error_response(StatusCode::BAD_REQUEST, message),
        QueryError::Timeout(_) => {
            tracing::warn!("Stats query timed out: {}", err);
            error_response(StatusCode::GATEWAY_TIMEOUT, err.to_string())
        }
        QueryError::Store(_) => {
            tracing::error!("Stats query failed: {}", err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub store: StoreStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domains: Option<usize>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        store: state.service.store_status().await,
        domains: state.domains.as_ref().map(|domains| domains.len()),
    })
}

pub async fn overview(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Overview> {
    state.service.overview(&params).await.map(Json).map_err(query_error)
}

pub async fn pageviews(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<PageviewSeries> {
    state.service.pageviews(&params).await.map(Json).map_err(query_error)
}

pub async fn top_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<TopItem>> {
    state.service.top_pages(&params).await.map(Json).map_err(query_error)
}

pub async fn top_sources(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<TopItem>> {
    state.service.top_sources(&params).await.map(Json).map_err(query_error)
}

pub async fn devices(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<DeviceBreakdown> {
    state.service.devices(&params).await.map(Json).map_err(query_error)
}

pub async fn geo(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<TopItem>> {
    state.service.geo(&params).await.map(Json).map_err(query_error)
}

pub async fn utm(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<UtmBreakdown> {
    state.service.utm(&params).await.map(Json).map_err(query_error)
}

pub async fn recent_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<EventItem>> {
    state.service.recent_events(&params).await.map(Json).map_err(query_error)
}

pub async fn event_breakdown(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<TopItem>> {
    state.service.event_breakdown(&params).await.map(Json).map_err(query_error)
}

pub async fn unique_pages(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<TopItem>> {
    state.service.unique_pages(&params).await.map(Json).map_err(query_error)
}

pub async fn autocapture_events(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<Vec<AutocaptureEvent>> {
    state
        .service
        .autocapture_events(&params)
        .await
        .map(Json)
        .map_err(query_error)
}

pub async fn funnel(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
) -> HandlerResult<FunnelResult> {
    state.service.funnel(&params).await.map(Json).map_err(query_error)
}

pub async fn funnel_advanced(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatsParams>,
    payload: Result<Json<FunnelAdvancedRequest>, JsonRejection>,
) -> HandlerResult<FunnelResult> {
    let Json(request) = payload.map_err(|rejection| {
        error_response(
            StatusCode::BAD_REQUEST,
            format!("invalid request body: {}", rejection.body_text()),
        )
    })?;

    state
        .service
        .funnel_advanced(&params, &request)
        .await
        .map(Json)
        .map_err(query_error)
}

#[derive(Deserialize)]
pub struct DomainCheckQuery {
    #[serde(default)]
    pub domain: String,
}

#[derive(Serialize)]
pub struct DomainCheckResponse {
    pub domain: String,
    pub exists: bool,
}

/// Whether a domain is registered with the stats service
pub async fn check_domain(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DomainCheckQuery>,
) -> HandlerResult<DomainCheckResponse> {
    let Some(domains) = state.domains.as_ref() else {
        return Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "domain sync is not configured",
        ));
    };

    if query.domain.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "domain parameter is required",
        ));
    }

    Ok(Json(DomainCheckResponse {
        exists: domains.domain_exists(&query.domain),
        domain: query.domain,
    }))
}
