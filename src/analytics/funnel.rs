use crate::models::{FunnelResult, FunnelStep, FunnelStepDef, StepKind};

/// Window applied to advanced funnels when the request gives none
pub const DEFAULT_WINDOW_MINUTES: i64 = 60;

/// Pathname matcher for a funnel step.
///
/// A trailing `*` turns the step into a prefix match that requires at least one
/// more character, so `/dashboard/*` matches `/dashboard/settings` but not
/// `/dashboard/` itself. Anything else is an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepPattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
}

impl<'a> StepPattern<'a> {
    pub fn parse(step: &'a str) -> Self {
        match step.strip_suffix('*') {
            Some(prefix) => StepPattern::Prefix(prefix),
            None => StepPattern::Exact(step),
        }
    }

    pub fn matches(&self, pathname: &str) -> bool {
        match self {
            StepPattern::Exact(step) => pathname == *step,
            StepPattern::Prefix(prefix) => {
                pathname.len() > prefix.len() && pathname.starts_with(prefix)
            }
        }
    }
}

pub fn matches_step(pathname: &str, step: &str) -> bool {
    StepPattern::parse(step).matches(pathname)
}

/// Funnel with every step at zero
pub fn empty_funnel(steps: &[String]) -> FunnelResult {
    FunnelResult {
        steps: steps
            .iter()
            .map(|name| FunnelStep {
                name: name.clone(),
                count: 0,
                percent: 0.0,
            })
            .collect(),
        ..FunnelResult::default()
    }
}

/// Assemble a funnel from per-step distinct visitor counts.
///
/// Percentages are relative to the first step and stay at zero when nobody
/// entered the funnel.
pub fn build_funnel(steps: &[String], counts: &[i64]) -> FunnelResult {
    let total_start = counts.first().copied().unwrap_or(0);
    let total_finish = if steps.is_empty() {
        0
    } else {
        counts.get(steps.len() - 1).copied().unwrap_or(0)
    };

    let steps = steps
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let count = counts.get(i).copied().unwrap_or(0);
            FunnelStep {
                name: name.clone(),
                count,
                percent: percent_of(count, total_start),
            }
        })
        .collect();

    FunnelResult {
        steps,
        total_start,
        total_finish,
        conversion: percent_of(total_finish, total_start),
        excluded_steps: Vec::new(),
    }
}

fn percent_of(count: i64, total: i64) -> f64 {
    if total > 0 {
        count as f64 / total as f64 * 100.0
    } else {
        0.0
    }
}

/// Split advanced steps into the pathnames that are evaluated and the steps
/// that are not (custom events and unknown kinds).
pub fn split_pageview_steps(steps: &[FunnelStepDef]) -> (Vec<String>, Vec<FunnelStepDef>) {
    let mut pageviews = Vec::new();
    let mut excluded = Vec::new();

    for step in steps {
        match step.kind {
            StepKind::Pageview => pageviews.push(step.value.clone()),
            StepKind::Event | StepKind::Unknown => excluded.push(step.clone()),
        }
    }

    (pageviews, excluded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_step() {
        let cases = [
            ("/dashboard", "/dashboard", true),
            ("/dashboard/settings", "/dashboard", false),
            ("/dashboard/settings", "/dashboard/*", true),
            ("/dashboard", "/dashboard/*", false),
            ("/dashboard/", "/dashboard/*", false),
            ("/", "/", true),
            ("/api/v1/users", "/api/*", true),
            ("/dashboard", "/dash*", true),
        ];

        for (pathname, step, expected) in cases {
            assert_eq!(
                matches_step(pathname, step),
                expected,
                "{pathname:?} against {step:?}"
            );
        }
    }

    #[test]
    fn test_build_funnel_percentages() {
        let steps = vec!["/".to_string(), "/pricing".to_string(), "/signup".to_string()];
        let funnel = build_funnel(&steps, &[200, 50, 10]);

        assert_eq!(funnel.total_start, 200);
        assert_eq!(funnel.total_finish, 10);
        assert_eq!(funnel.steps[0].percent, 100.0);
        assert_eq!(funnel.steps[1].percent, 25.0);
        assert_eq!(funnel.conversion, 5.0);
    }

    #[test]
    fn test_build_funnel_without_entrants() {
        let steps = vec!["/a".to_string(), "/b".to_string()];
        let funnel = build_funnel(&steps, &[0, 3]);

        assert!(funnel.steps.iter().all(|s| s.percent == 0.0));
        assert_eq!(funnel.conversion, 0.0);
        assert_eq!(funnel.total_finish, 3);
    }

    #[test]
    fn test_split_pageview_steps() {
        let steps = vec![
            FunnelStepDef::pageview("/"),
            FunnelStepDef {
                kind: StepKind::Event,
                value: "click".to_string(),
                text: "Buy".to_string(),
                tag: String::new(),
            },
            FunnelStepDef::pageview("/thanks"),
        ];

        let (pageviews, excluded) = split_pageview_steps(&steps);
        assert_eq!(pageviews, vec!["/", "/thanks"]);
        assert_eq!(excluded.len(), 1);
        assert_eq!(excluded[0].value, "click");
    }
}
