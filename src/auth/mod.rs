//! Authorization data consulted by the stats API

pub mod domain_cache;

pub use domain_cache::{DomainCache, DomainSyncError};
