use std::collections::HashMap;
use std::net::IpAddr;

use reqwest::Url;

use super::top_n;
use crate::models::TopItem;

/// Label for visits without an external referrer
pub const DIRECT: &str = "Direct";

// Second-level labels that make the registrable domain three labels deep
// under a two-letter TLD (example.co.uk, example.com.au).
const SECOND_LEVEL_LABELS: &[&str] = &["co", "com", "net", "org", "gov", "ac", "edu"];

/// Reduce a referrer URL to the site that sent the visit.
///
/// Empty or unparsable referrers, and referrers on `domain` or any of its
/// subdomains, count as [`DIRECT`]. Everything else collapses to its
/// registrable domain, so `https://www.google.com/search?q=x` and
/// `https://news.google.com/` both become `google.com`.
pub fn clean_referrer(referrer: &str, domain: &str) -> String {
    let referrer = referrer.trim();
    if referrer.is_empty() {
        return DIRECT.to_string();
    }

    let Ok(url) = Url::parse(referrer) else {
        return DIRECT.to_string();
    };
    let Some(host) = url.host_str() else {
        return DIRECT.to_string();
    };

    let host = host.trim_end_matches('.').to_ascii_lowercase();
    let host = host.strip_prefix("www.").unwrap_or(&host);
    let domain = domain.trim().to_ascii_lowercase();
    let domain = domain.strip_prefix("www.").unwrap_or(&domain);

    if host.is_empty() {
        return DIRECT.to_string();
    }
    if !domain.is_empty() && (host == domain || host.ends_with(&format!(".{domain}"))) {
        return DIRECT.to_string();
    }

    registrable_domain(host)
}

/// Public-suffix-free approximation of a host's registrable domain
pub fn registrable_domain(host: &str) -> String {
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    let labels: Vec<&str> = host.split('.').filter(|label| !label.is_empty()).collect();
    let keep = match labels.as_slice() {
        [.., second, tld] if tld.len() == 2 && SECOND_LEVEL_LABELS.contains(second) => 3,
        _ => 2,
    };

    labels[labels.len().saturating_sub(keep)..].join(".")
}

/// Fold raw `(referrer, count)` rows into the top `limit` sources
pub fn fold_sources<I>(rows: I, domain: &str, limit: usize) -> Vec<TopItem>
where
    I: IntoIterator<Item = (String, i64)>,
{
    let mut counts: HashMap<String, i64> = HashMap::new();
    for (referrer, count) in rows {
        *counts.entry(clean_referrer(&referrer, domain)).or_default() += count;
    }
    top_n(counts, limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_referrer() {
        let cases = [
            ("", "Direct"),
            ("https://www.google.com/search?q=test", "google.com"),
            ("https://example.com/page", "Direct"),
            ("https://sub.example.com/", "Direct"),
            ("invalid-url", "Direct"),
            ("https://twitter.com/user/status/123", "twitter.com"),
            ("https://news.ycombinator.com/item?id=1", "ycombinator.com"),
            ("https://www.bbc.co.uk/news", "bbc.co.uk"),
            ("http://127.0.0.1:3000/", "127.0.0.1"),
        ];

        for (referrer, expected) in cases {
            assert_eq!(
                clean_referrer(referrer, "example.com"),
                expected,
                "referrer {referrer:?}"
            );
        }
    }

    #[test]
    fn test_same_domain_ignores_www_and_case() {
        assert_eq!(clean_referrer("https://WWW.Example.com/", "example.com"), DIRECT);
        assert_eq!(clean_referrer("https://example.com/", "www.example.com"), DIRECT);
        // A different site merely ending in the same characters is external
        assert_eq!(
            clean_referrer("https://notexample.com/", "example.com"),
            "notexample.com"
        );
    }

    #[test]
    fn test_fold_sources_merges_and_ranks() {
        let rows = vec![
            ("https://www.google.com/search?q=a".to_string(), 2),
            ("https://google.com/".to_string(), 3),
            ("".to_string(), 1),
            ("https://app.example.com/x".to_string(), 1),
            ("https://github.com/org/repo".to_string(), 4),
        ];

        let sources = fold_sources(rows, "example.com", 10);
        assert_eq!(
            sources,
            vec![
                TopItem::new("google.com", 5),
                TopItem::new("github.com", 4),
                TopItem::new(DIRECT, 2),
            ]
        );
    }
}
