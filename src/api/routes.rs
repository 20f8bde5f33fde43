use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::CorsConfig;

use super::handlers::{
    autocapture_events, check_domain, devices, event_breakdown, funnel, funnel_advanced, geo,
    health_check, overview, pageviews, recent_events, top_pages, top_sources, unique_pages, utm,
    AppState,
};

pub fn create_api_router(state: AppState, cors: &CorsConfig) -> Router {
    let state = Arc::new(state);

    let stats_routes = Router::new()
        .route("/overview", get(overview))
        .route("/pageviews", get(pageviews))
        .route("/pages", get(top_pages))
        .route("/sources", get(top_sources))
        .route("/devices", get(devices))
        .route("/geo", get(geo))
        .route("/utm", get(utm))
        .route("/events", get(recent_events))
        .route("/event-breakdown", get(event_breakdown))
        .route("/unique-pages", get(unique_pages))
        .route("/autocapture-events", get(autocapture_events))
        .route("/funnel", get(funnel))
        .route("/funnel-advanced", post(funnel_advanced));

    Router::new()
        .route("/health", get(health_check))
        .route("/api/domains/check", get(check_domain))
        .nest("/api/stats", stats_routes)
        .with_state(state)
        .layer(cors_layer(cors))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(cors: &CorsConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cors
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}
