use std::collections::HashSet;

use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use url::Url;

use super::base;

static ANCHOR_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a[href]").expect("anchor selector"));

const TRACKING_PARAMS: [&str; 7] = ["aff", "fbclid", "gclid", "ref", "_eboga", "mc_cid", "mc_eid"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPolicy {
    /// Detail pages are identified by path alone.
    DropAll,
    /// Keep the query but remove tracking parameters.
    DropTracking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkPattern {
    pub contains: &'static str,
    pub query: QueryPolicy,
}

/// Detail-page links found in a rendered listing page, absolute and
/// normalized, de-duplicated in discovery order.
pub fn discover(html: &str, base_url: &str, pattern: &LinkPattern) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(url) = base::absolute_url(base_url, href) else {
            continue;
        };
        let Some(normalized) = normalize(url, pattern.query) else {
            continue;
        };
        if !normalized.path().contains(pattern.contains) {
            continue;
        }
        let normalized = normalized.to_string();
        if seen.insert(normalized.clone()) {
            links.push(normalized);
        }
    }

    links
}

fn normalize(mut url: Url, policy: QueryPolicy) -> Option<Url> {
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.set_fragment(None);

    match policy {
        QueryPolicy::DropAll => url.set_query(None),
        QueryPolicy::DropTracking => {
            let kept: Vec<(String, String)> = url
                .query_pairs()
                .filter(|(key, _)| !is_tracking_param(key))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            if kept.is_empty() {
                url.set_query(None);
            } else {
                url.query_pairs_mut().clear().extend_pairs(kept);
            }
        }
    }

    Some(url)
}

fn is_tracking_param(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    key.starts_with("utm_") || TRACKING_PARAMS.contains(&key.as_str())
}
