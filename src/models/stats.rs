use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Half-open query window `[from, to)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn from_micros(&self) -> i64 {
        self.from.timestamp_micros()
    }

    pub fn to_micros(&self) -> i64 {
        self.to.timestamp_micros()
    }

    pub fn duration(&self) -> Duration {
        self.to - self.from
    }

    /// Bucket size used for time series over this window
    pub fn interval(&self) -> Interval {
        if self.duration() > Duration::days(7) {
            Interval::Day
        } else {
            Interval::Hour
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    Hour,
    Day,
}

impl Interval {
    pub fn as_str(self) -> &'static str {
        match self {
            Interval::Hour => "hour",
            Interval::Day => "day",
        }
    }

    /// Bucket width in microseconds
    pub fn micros(self) -> i64 {
        match self {
            Interval::Hour => 3_600_000_000,
            Interval::Day => 86_400_000_000,
        }
    }

    /// Label for the bucket starting at `bucket`
    pub fn format_bucket(self, bucket: DateTime<Utc>) -> String {
        match self {
            Interval::Hour => bucket.format("%Y-%m-%dT%H:00").to_string(),
            Interval::Day => bucket.format("%Y-%m-%d").to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overview {
    pub pageviews: i64,
    pub unique_visitors: i64,
    pub events: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub time: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopItem {
    pub name: String,
    pub count: i64,
}

impl TopItem {
    pub fn new(name: impl Into<String>, count: i64) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// A single raw event as shown in the live feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventItem {
    pub name: String,
    pub url: String,
    pub pathname: String,
    pub country: String,
    pub browser: String,
    pub os: String,
    pub device: String,
    /// UTC, `YYYY-MM-DD HH:MM:SS`
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub props: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunnelStep {
    pub name: String,
    pub count: i64,
    pub percent: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunnelResult {
    pub steps: Vec<FunnelStep>,
    pub total_start: i64,
    pub total_finish: i64,
    pub conversion: f64,
    /// Steps of an advanced funnel that were not evaluated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded_steps: Vec<FunnelStepDef>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Pageview,
    Event,
    #[serde(other)]
    Unknown,
}

/// One step of an advanced funnel request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunnelStepDef {
    #[serde(rename = "type")]
    pub kind: StepKind,
    pub value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
}

impl FunnelStepDef {
    pub fn pageview(value: impl Into<String>) -> Self {
        Self {
            kind: StepKind::Pageview,
            value: value.into(),
            text: String::new(),
            tag: String::new(),
        }
    }
}

/// Aggregated interaction (`click`, `submit`, `change`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutocaptureEvent {
    pub event_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tag: String,
    pub pathname: String,
    pub count: i64,
}
