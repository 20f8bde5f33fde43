//! End-to-end queries against a live ClickHouse server
//!
//! Ignored by default. Run with a reachable server:
//! `CLICKHOUSE_URL=http://localhost:8123 cargo test --test clickhouse_e2e -- --ignored`

use chrono::{TimeZone, Utc};
use clickhouse::Client;
use clickresearch_stats::config::{ClickHouseConfig, S3Config};
use clickresearch_stats::models::{Interval, TimeWindow, TopItem};
use clickresearch_stats::storage::{AnalyticsStore, ClickHouseStore, TableSource};

const DATABASE: &str = "clickresearch_e2e";

const ROWS: &str = "
('example.com', 'v1', 'pageview', 'https://example.com/', '/', 'https://www.google.com/', 'newsletter', '2024-01-15 10:05:00', 'Chrome', 'macOS', 'desktop', 'US', '{}'),
('example.com', 'v1', 'pageview', 'https://example.com/dashboard/', '/dashboard/', 'https://example.com/', '', '2024-01-15 10:10:00', 'Chrome', 'macOS', 'desktop', 'US', '{}'),
('example.com', 'v2', 'pageview', 'https://example.com/', '/', '', '', '2024-01-15 10:20:00', 'Firefox', 'Linux', 'desktop', 'DE', '{}'),
('example.com', 'v2', 'click', 'https://example.com/', '/', '', '', '2024-01-15 10:21:00', 'Firefox', 'Linux', '', 'DE', '{\"text\":\"Sign up\",\"tag\":\"button\"}'),
('example.com', 'v3', 'pageview', 'https://example.com/', '/', 'https://news.ycombinator.com/item', '', '2024-01-15 11:00:00', 'Safari', 'iOS', 'mobile', '', '{}'),
('example.com', 'v3', 'pageview', 'https://example.com/dashboard/settings', '/dashboard/settings', '', '', '2024-01-15 11:30:00', 'Safari', 'iOS', 'mobile', '', '{}'),
('example.com', 'v4', 'pageview', 'https://example.com/', '/', '', '', '2024-01-16 00:00:00', 'Safari', 'iOS', 'mobile', '', '{}'),
('other.com', 'v9', 'pageview', 'https://other.com/', '/', '', '', '2024-01-15 10:00:00', 'Chrome', 'Windows', 'desktop', 'FR', '{}')";

fn s3_config() -> S3Config {
    S3Config {
        endpoint: "localhost:9000".to_string(),
        access_key: String::new(),
        secret_key: String::new(),
        bucket: "events".to_string(),
        prefix: String::new(),
        use_ssl: false,
    }
}

fn window() -> TimeWindow {
    TimeWindow::new(
        Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2024, 1, 16, 0, 0, 0).unwrap(),
    )
}

async fn seeded_store(url: &str) -> ClickHouseStore {
    Client::default()
        .with_url(url)
        .query(&format!("CREATE DATABASE IF NOT EXISTS {DATABASE}"))
        .execute()
        .await
        .unwrap();

    let config = ClickHouseConfig {
        url: url.to_string(),
        database: DATABASE.to_string(),
        user: None,
        password: None,
        sync_interval_secs: 3600,
    };
    let store = ClickHouseStore::connect(&config, &s3_config()).await.unwrap();

    let client = Client::default().with_url(url).with_database(DATABASE);
    client.query("TRUNCATE TABLE events").execute().await.unwrap();
    client
        .query(&format!(
            "INSERT INTO events
                (domain, visitor_id, name, url, pathname, referrer, utm_source, timestamp,
                 browser, os, device, country, props)
             VALUES {ROWS}"
        ))
        .execute()
        .await
        .unwrap();

    store
}

#[tokio::test]
#[ignore]
async fn test_clickhouse_queries() {
    let Ok(url) = std::env::var("CLICKHOUSE_URL") else {
        eprintln!("CLICKHOUSE_URL not set, skipping");
        return;
    };
    let store = seeded_store(&url).await;
    let domain = "example.com";

    assert!(store.is_ready());
    assert_eq!(store.status().await.source, TableSource::Replica);

    let overview = store.get_overview(domain, window()).await.unwrap();
    assert_eq!(overview.pageviews, 5);
    assert_eq!(overview.unique_visitors, 3);
    assert_eq!(overview.events, 6);

    let series = store
        .get_pageviews_time_series(domain, window(), Interval::Hour)
        .await
        .unwrap();
    let values: Vec<(String, i64)> = series.into_iter().map(|p| (p.time, p.value)).collect();
    assert_eq!(
        values,
        vec![
            ("2024-01-15T10:00".to_string(), 3),
            ("2024-01-15T11:00".to_string(), 2),
        ]
    );

    let pages = store.get_top_pages(domain, window(), 10).await.unwrap();
    assert_eq!(pages[0], TopItem::new("/", 3));

    let sources = store.get_top_sources(domain, window(), 10).await.unwrap();
    assert_eq!(
        sources,
        vec![
            TopItem::new("Direct", 3),
            TopItem::new("google.com", 1),
            TopItem::new("ycombinator.com", 1),
        ]
    );

    let countries = store.get_top_countries(domain, window(), 10).await.unwrap();
    assert_eq!(
        countries,
        vec![
            TopItem::new("DE", 2),
            TopItem::new("US", 2),
            TopItem::new("Unknown", 2),
        ]
    );

    let utm = store.get_top_utm_sources(domain, window(), 10).await.unwrap();
    assert_eq!(
        utm,
        vec![TopItem::new("Unknown", 4), TopItem::new("newsletter", 1)]
    );

    let events = store.get_recent_events(domain, window(), 2).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].pathname, "/dashboard/settings");
    assert_eq!(events[0].timestamp, "2024-01-15 11:30:00");

    let funnel = store
        .get_funnel(
            domain,
            window(),
            &["/".to_string(), "/dashboard/*".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(funnel.total_start, 3);
    assert_eq!(funnel.total_finish, 1);

    let autocapture = store
        .get_autocapture_events(domain, window(), 10)
        .await
        .unwrap();
    assert_eq!(autocapture.len(), 1);
    assert_eq!(autocapture[0].text, "Sign up");
    assert_eq!(autocapture[0].count, 1);

    store.close().await.unwrap();
}
