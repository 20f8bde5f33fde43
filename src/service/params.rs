use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::models::{FunnelStepDef, TimeWindow};

/// Funnel used when a request gives no steps
pub const DEFAULT_FUNNEL_STEPS: &str = "/,/dashboard/";

/// Raw query-string parameters shared by the stats endpoints
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatsParams {
    pub domain: Option<String>,
    pub period: Option<String>,
    /// Kept as text; invalid values fall back to the endpoint default
    pub limit: Option<String>,
    pub steps: Option<String>,
}

/// Body of an advanced funnel request
#[derive(Debug, Clone, Deserialize)]
pub struct FunnelAdvancedRequest {
    pub steps: Vec<FunnelStepDef>,
    /// Minutes; zero or negative means the default
    #[serde(default)]
    pub window: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Today,
    Days7,
    Days30,
    Days90,
}

impl Period {
    /// Unknown or missing tokens mean the last 7 days
    pub fn parse(token: Option<&str>) -> Self {
        match token.map(str::trim) {
            Some("today") => Period::Today,
            Some("30d") => Period::Days30,
            Some("90d") => Period::Days90,
            _ => Period::Days7,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Period::Today => "today",
            Period::Days7 => "7d",
            Period::Days30 => "30d",
            Period::Days90 => "90d",
        }
    }

    /// Window ending at `now`. `today` starts at UTC midnight.
    pub fn window(self, now: DateTime<Utc>) -> TimeWindow {
        let from = match self {
            Period::Today => now
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .map(|midnight| midnight.and_utc())
                .unwrap_or(now),
            Period::Days7 => now - Duration::days(7),
            Period::Days30 => now - Duration::days(30),
            Period::Days90 => now - Duration::days(90),
        };
        TimeWindow::new(from, now)
    }
}

/// A positive integer, or `default` for anything else
pub fn parse_limit(raw: Option<&str>, default: usize) -> usize {
    raw.and_then(|value| value.trim().parse::<i64>().ok())
        .filter(|limit| *limit > 0)
        .map(|limit| limit as usize)
        .unwrap_or(default)
}

/// Comma-separated steps with empty segments dropped
pub fn split_steps(raw: &str) -> Vec<String> {
    raw.split(',')
        .filter(|step| !step.is_empty())
        .map(str::to_string)
        .collect()
}
