use std::time::Duration;

use super::discovery::{LinkPattern, QueryPolicy};
use super::extract::{DomHints, ExtractionStrategy};
use super::{DelayPolicy, SourceDriver};

pub struct CityOfSydney;

impl SourceDriver for CityOfSydney {
    fn source_id(&self) -> &'static str {
        "city_of_sydney"
    }

    fn source_name(&self) -> &'static str {
        "Whats On Sydney"
    }

    fn listing_url(&self) -> &'static str {
        "https://whatson.cityofsydney.nsw.gov.au"
    }

    fn link_pattern(&self) -> LinkPattern {
        LinkPattern {
            contains: "/events/",
            query: QueryPolicy::DropTracking,
        }
    }

    fn strategy(&self) -> ExtractionStrategy {
        ExtractionStrategy {
            structured_data: true,
            open_graph: true,
            dom: Some(DomHints {
                title: "h1",
                description: r#"div[class*="description"], div[class*="content"]"#,
                date: Some(r#"div[class*="date"]"#),
                venue: r#"a[href*="/venues/"]"#,
                address: "address",
                category: Some(r#"a[href*="/categories/"], span[class*="category"]"#),
            }),
            fallback_venue: Some("Sydney location"),
            fallback_address: Some("Sydney, NSW"),
        }
    }

    fn delay(&self) -> DelayPolicy {
        DelayPolicy {
            base: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING_HTML: &str = r#"
    <html><body>
      <header><a href="/">Home</a><a href="/venues/">Venues</a></header>
      <ul class="event-list">
        <li><a href="/events/sydney-lunar-festival?utm_source=homepage">Sydney Lunar Festival</a></li>
        <li><a href="/events/art-after-hours">Art After Hours</a></li>
        <li><a href="https://whatson.cityofsydney.nsw.gov.au/events/art-after-hours#details">Art After Hours</a></li>
      </ul>
    </body></html>
    "#;

    const SAMPLE_HTML: &str = r#"
    <html><head>
      <meta property="og:image" content="https://whatson.cityofsydney.nsw.gov.au/img/lanterns.jpg">
      <meta property="og:start_time" content="2025-02-01T19:00:00+11:00">
    </head>
    <body>
      <h1>Sydney Lunar Festival</h1>
      <div class="event-date">Saturday 1 February, 7pm to 10pm</div>
      <a href="/categories/festivals">Festivals</a>
      <div class="event-description"><p>Celebrate the Year of the Snake with lanterns.</p></div>
      <a href="/venues/circular-quay">Circular Quay</a>
    </body></html>
    "#;

    #[test]
    fn discovers_detail_links_from_listing() {
        let links = CityOfSydney.discover_links(LISTING_HTML);
        assert_eq!(
            links,
            vec![
                "https://whatson.cityofsydney.nsw.gov.au/events/sydney-lunar-festival".to_string(),
                "https://whatson.cityofsydney.nsw.gov.au/events/art-after-hours".to_string(),
            ]
        );
    }

    #[test]
    fn extracts_event_with_fallback_address() {
        let url = "https://whatson.cityofsydney.nsw.gov.au/events/sydney-lunar-festival";
        let event = CityOfSydney
            .extract_event(SAMPLE_HTML, url)
            .expect("event extracted");

        assert_eq!(event.original_url, url);
        assert_eq!(event.title, "Sydney Lunar Festival");
        assert_eq!(event.date.as_deref(), Some("2025-02-01T19:00:00+11:00"));
        assert_eq!(event.time.as_deref(), Some("7:00 PM"));
        assert_eq!(event.venue.as_deref(), Some("Circular Quay"));
        assert_eq!(event.address.as_deref(), Some("Sydney, NSW"));
        assert_eq!(event.category.as_deref(), Some("Festivals"));
        assert_eq!(
            event.description.as_deref(),
            Some("Celebrate the Year of the Snake with lanterns.")
        );
        assert_eq!(event.city, "Sydney");
        assert_eq!(event.source_website, "Whats On Sydney");
    }
}
