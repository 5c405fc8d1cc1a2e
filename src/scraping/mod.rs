pub mod base;
pub mod city_of_sydney;
pub mod discovery;
pub mod eventbrite;
pub mod extract;

use std::time::Duration;

use chrono_tz::Tz;
use rand::Rng;

use crate::models::ExtractedEvent;
use discovery::LinkPattern;
use extract::{ExtractionStrategy, SourceContext};

pub const DEFAULT_LINK_CAP: usize = 50;

/// Pause between consecutive detail fetches of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelayPolicy {
    pub base: Duration,
    /// Upper bound of the uniform random extra wait.
    pub jitter: Duration,
}

impl DelayPolicy {
    pub fn next_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.base;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis() as u64);
        self.base + Duration::from_millis(extra_ms)
    }
}

/// Everything the crawler needs to know about one listing site.
pub trait SourceDriver: Send + Sync {
    fn source_id(&self) -> &'static str;
    /// Stored as `source_website` on every record the source produces.
    fn source_name(&self) -> &'static str;
    fn listing_url(&self) -> &'static str;
    fn link_pattern(&self) -> LinkPattern;
    fn strategy(&self) -> ExtractionStrategy;
    fn delay(&self) -> DelayPolicy;

    fn link_cap(&self) -> usize {
        DEFAULT_LINK_CAP
    }

    fn city(&self) -> &'static str {
        "Sydney"
    }

    fn timezone(&self) -> Tz {
        chrono_tz::Australia::Sydney
    }

    fn discover_links(&self, listing_html: &str) -> Vec<String> {
        discovery::discover(listing_html, self.listing_url(), &self.link_pattern())
    }

    fn extract_event(&self, detail_html: &str, url: &str) -> Option<ExtractedEvent> {
        let context = SourceContext {
            source_website: self.source_name(),
            city: self.city(),
            timezone: self.timezone(),
        };
        extract::extract(detail_html, url, &self.strategy(), &context)
    }
}

#[derive(Clone, Debug, serde::Serialize)]
pub struct SourceInfo {
    pub id: String,
    pub name: String,
    pub url: String,
}

/// Crawl order is the order of this list.
pub fn active_sources() -> Vec<Box<dyn SourceDriver>> {
    vec![
        Box::new(city_of_sydney::CityOfSydney),
        Box::new(eventbrite::Eventbrite),
    ]
}

pub fn list_sources() -> Vec<SourceInfo> {
    active_sources()
        .into_iter()
        .map(|source| SourceInfo {
            id: source.source_id().to_string(),
            name: source.source_name().to_string(),
            url: source.listing_url().to_string(),
        })
        .collect()
}

pub fn find_source(id: &str) -> Option<Box<dyn SourceDriver>> {
    active_sources()
        .into_iter()
        .find(|source| source.source_id() == id)
}
