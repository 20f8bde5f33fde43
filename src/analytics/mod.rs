//! Pure aggregation helpers shared by the store backends
//!
//! Backends push filtering and grouping into SQL; everything here runs over
//! the already-grouped rows so both engines fold results the same way.

pub mod funnel;
pub mod ranking;
pub mod referrer;

pub use funnel::{build_funnel, empty_funnel, matches_step, split_pageview_steps, StepPattern};
pub use ranking::top_n;
pub use referrer::{clean_referrer, fold_sources, registrable_domain, DIRECT};
