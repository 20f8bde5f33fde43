/// Grouping column for ranking queries.
///
/// Column names are fixed here so ranking SQL never interpolates caller input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Pathname,
    Browser,
    Country,
    Device,
    UtmSource,
    UtmMedium,
    UtmCampaign,
    EventName,
}

impl Dimension {
    pub fn column(self) -> &'static str {
        match self {
            Dimension::Pathname => "pathname",
            Dimension::Browser => "browser",
            Dimension::Country => "country",
            Dimension::Device => "device",
            Dimension::UtmSource => "utm_source",
            Dimension::UtmMedium => "utm_medium",
            Dimension::UtmCampaign => "utm_campaign",
            Dimension::EventName => "name",
        }
    }

    /// Whether only pageview events count towards this ranking
    pub fn pageviews_only(self) -> bool {
        matches!(
            self,
            Dimension::Pathname
                | Dimension::UtmSource
                | Dimension::UtmMedium
                | Dimension::UtmCampaign
        )
    }
}

/// Label for empty dimension values
pub const UNKNOWN: &str = "Unknown";

/// Device label for events recorded without one
pub const DEFAULT_DEVICE: &str = "desktop";

/// Interaction event names reported by autocapture
pub const AUTOCAPTURE_EVENTS: &[&str] = &["click", "submit", "change"];

/// Number of event names in the breakdown
pub const EVENT_BREAKDOWN_LIMIT: usize = 10;
