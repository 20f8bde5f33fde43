pub mod clickhouse_store;
pub mod dimension;
pub mod duckdb_store;
pub mod trait_def;

pub use clickhouse_store::ClickHouseStore;
pub use dimension::Dimension;
pub use duckdb_store::DuckDbStore;
pub use trait_def::{AnalyticsStore, StoreError, StoreResult, StoreStatus, TableSource};
