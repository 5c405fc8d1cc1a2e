use std::time::Duration;

use super::discovery::{LinkPattern, QueryPolicy};
use super::extract::{DomHints, ExtractionStrategy};
use super::{DelayPolicy, SourceDriver};

pub struct Eventbrite;

impl SourceDriver for Eventbrite {
    fn source_id(&self) -> &'static str {
        "eventbrite"
    }

    fn source_name(&self) -> &'static str {
        "Eventbrite"
    }

    fn listing_url(&self) -> &'static str {
        "https://www.eventbrite.com.au/d/australia--sydney/events/?sort=date"
    }

    fn link_pattern(&self) -> LinkPattern {
        LinkPattern {
            contains: "/e/",
            query: QueryPolicy::DropAll,
        }
    }

    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy {
            structured_data: true,
            open_graph: true,
            dom: Some(DomHints {
                date: Some("time[datetime], [class*=\"date-info\"]"),
                venue: r#"[class*="location-info__address-text"], [class*="venue"]"#,
                ..DomHints::default()
            }),
            fallback_venue: Some("Sydney"),
            fallback_address: None,
        }
    }

    fn delay(&self) -> DelayPolicy {
        DelayPolicy {
            base: Duration::from_millis(2500),
            jitter: Duration::from_millis(1000),
        }
    }
}
