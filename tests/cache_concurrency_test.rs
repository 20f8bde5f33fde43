//! Concurrent access tests for the result cache
//!
//! Many writers replace the same keys while readers decode them; a reader must
//! only ever see a complete value that some writer stored.

use clickresearch_stats::cache::TtlCache;
use clickresearch_stats::models::{Overview, TopItem};
use std::sync::Arc;
use std::time::Duration;

fn payload(writer: i64, round: i64) -> Vec<TopItem> {
    (0..20)
        .map(|i| TopItem::new(format!("/w{writer}/r{round}/{i}"), writer * 1_000 + round))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_writers_and_readers_see_whole_values() {
    let cache = Arc::new(TtlCache::new(Duration::from_secs(300)));
    let keys: Vec<String> = (0..8).map(|i| format!("pages:site{i}.com:7d:10")).collect();

    let mut handles = Vec::new();

    for writer in 0..8_i64 {
        let cache = Arc::clone(&cache);
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..200_i64 {
                let key = &keys[(writer + round) as usize % keys.len()];
                cache.set(key, &payload(writer, round));
                if round % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    for _ in 0..8 {
        let cache = Arc::clone(&cache);
        let keys = keys.clone();
        handles.push(tokio::spawn(async move {
            for round in 0..400 {
                let key = &keys[round % keys.len()];
                if let Some(items) = cache.get::<Vec<TopItem>>(key) {
                    assert_eq!(items.len(), 20);
                    // Every item of one value carries the same writer/round stamp
                    let stamp = items[0].count;
                    assert!(items.iter().all(|item| item.count == stamp));
                    let prefix = format!("/w{}/r{}/", stamp / 1_000, stamp % 1_000);
                    assert!(items.iter().all(|item| item.name.starts_with(&prefix)));
                }
                if round % 16 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.len(), keys.len());
    for key in &keys {
        assert!(cache.get::<Vec<TopItem>>(key).is_some());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_distinct_keys_do_not_interfere() {
    let cache = Arc::new(TtlCache::new(Duration::from_secs(300)));

    let handles: Vec<_> = (0..50_i64)
        .map(|i| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let key = format!("overview:site{i}.com:30d");
                let value = Overview {
                    pageviews: i,
                    unique_visitors: i * 2,
                    events: i * 3,
                };
                cache.set(&key, &value);
                cache.get::<Overview>(&key)
            })
        })
        .collect();

    for (i, handle) in handles.into_iter().enumerate() {
        let i = i as i64;
        let stored = handle.await.unwrap().expect("entry just written");
        assert_eq!(stored.pageviews, i);
        assert_eq!(stored.unique_visitors, i * 2);
        assert_eq!(stored.events, i * 3);
    }

    assert_eq!(cache.len(), 50);
}
