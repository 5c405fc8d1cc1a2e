//! Turns a rendered detail page into an [`ExtractedEvent`].
//!
//! Stages run from most to least reliable: embedded schema.org JSON-LD,
//! Open Graph style meta tags, then DOM heuristics. A stage only fills
//! fields that are still empty, so an earlier value is never replaced.

use chrono_tz::Tz;
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use serde_json::Value;
use tracing::debug;

use super::base;
use crate::models::ExtractedEvent;

pub const MAX_DESCRIPTION_CHARS: usize = 1000;

static JSON_LD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"script[type="application/ld+json"]"#).expect("json-ld selector")
});
static OG_TITLE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:title"]"#).expect("og:title selector"));
static OG_DESCRIPTION: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="og:description"]"#).expect("og:description selector")
});
static OG_IMAGE: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[property="og:image"]"#).expect("og:image selector"));
static OG_START_TIME: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"meta[property="event:start_time"], meta[property="og:start_time"]"#)
        .expect("start time selector")
});

/// CSS selectors for the last-resort DOM stage.
#[derive(Debug, Clone, Copy)]
pub struct DomHints {
    pub title: &'static str,
    pub description: &'static str,
    pub date: Option<&'static str>,
    pub venue: &'static str,
    pub address: &'static str,
    pub category: Option<&'static str>,
}

impl Default for DomHints {
    fn default() -> Self {
        Self {
            title: "h1",
            description: r#"div[class*="description"], div[class*="content"]"#,
            date: None,
            venue: r#"a[href*="/venues/"]"#,
            address: "address",
            category: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractionStrategy {
    pub structured_data: bool,
    pub open_graph: bool,
    pub dom: Option<DomHints>,
    pub fallback_venue: Option<&'static str>,
    pub fallback_address: Option<&'static str>,
}

/// Who the record is for: stamped onto every extracted event.
#[derive(Debug, Clone, Copy)]
pub struct SourceContext<'a> {
    pub source_website: &'a str,
    pub city: &'a str,
    pub timezone: Tz,
}

#[derive(Debug, Default)]
struct Draft {
    title: Option<String>,
    date: Option<String>,
    time: Option<String>,
    venue: Option<String>,
    address: Option<String>,
    description: Option<String>,
    category: Option<String>,
    image_url: Option<String>,
}

fn fill(slot: &mut Option<String>, value: Option<String>) {
    if slot.is_none() {
        *slot = value;
    }
}

fn single_line(value: &str) -> Option<String> {
    base::non_empty(&base::clean_text(value))
}

/// Returns `None` when no title could be found; the caller drops the link.
pub fn extract(
    html: &str,
    url: &str,
    strategy: &ExtractionStrategy,
    source: &SourceContext<'_>,
) -> Option<ExtractedEvent> {
    let document = Html::parse_document(html);
    let mut draft = Draft::default();

    if strategy.structured_data {
        apply_structured_data(&document, url, &mut draft);
    }
    if strategy.open_graph {
        apply_open_graph(&document, &mut draft);
    }
    if let Some(hints) = strategy.dom.as_ref() {
        apply_dom(&document, hints, &mut draft);
    }

    if draft.time.is_none() {
        draft.time = draft.date.as_deref().and_then(|date| {
            base::local_time_of(date, source.timezone).or_else(|| base::find_first_time(date))
        });
    }
    fill(&mut draft.venue, strategy.fallback_venue.map(str::to_string));
    fill(&mut draft.address, strategy.fallback_address.map(str::to_string));

    let title = draft.title?;
    let image_url = draft
        .image_url
        .and_then(|src| base::absolute_url(url, &src))
        .map(|u| u.to_string());

    Some(ExtractedEvent {
        original_url: url.to_string(),
        title,
        date: draft.date,
        time: draft.time,
        venue: draft.venue,
        address: draft.address,
        city: source.city.to_string(),
        description: draft
            .description
            .map(|text| base::truncate_chars(&text, MAX_DESCRIPTION_CHARS)),
        category: draft.category,
        image_url,
        source_website: source.source_website.to_string(),
    })
}

fn apply_structured_data(document: &Html, url: &str, draft: &mut Draft) {
    for script in document.select(&JSON_LD_SELECTOR) {
        let raw = script.text().collect::<String>();
        if raw.trim().is_empty() {
            continue;
        }
        let json: Value = match serde_json::from_str(raw.trim()) {
            Ok(json) => json,
            Err(err) => {
                debug!("malformed structured data on {url}: {err}");
                continue;
            }
        };
        let Some(event) = find_event_node(&json) else {
            continue;
        };

        let text = |key: &str| string_field(event, key);
        fill(&mut draft.title, text("name").as_deref().and_then(single_line));
        fill(&mut draft.date, text("startDate").as_deref().and_then(base::non_empty));
        fill(
            &mut draft.description,
            text("description").as_deref().and_then(base::non_empty),
        );
        fill(&mut draft.image_url, image_of(event));
        fill(&mut draft.category, category_of(event));

        let location = match event.get("location") {
            Some(Value::Array(items)) => items.first(),
            other => other,
        };
        if let Some(location) = location {
            match location {
                Value::String(text) => fill(&mut draft.venue, single_line(text)),
                Value::Object(_) => {
                    fill(
                        &mut draft.venue,
                        string_field(location, "name").as_deref().and_then(single_line),
                    );
                    fill(&mut draft.address, location.get("address").and_then(address_of));
                }
                _ => {}
            }
        }
        return;
    }
}

/// First node typed as an Event (or an Event subtype) in an object, array or `@graph`.
fn find_event_node(value: &Value) -> Option<&Value> {
    match value {
        Value::Array(items) => items.iter().find_map(find_event_node),
        Value::Object(map) => {
            if event_type(value).is_some() {
                return Some(value);
            }
            map.get("@graph").and_then(find_event_node)
        }
        _ => None,
    }
}

fn event_type(node: &Value) -> Option<&str> {
    match node.get("@type")? {
        Value::String(kind) if kind.ends_with("Event") => Some(kind.as_str()),
        Value::Array(kinds) => kinds
            .iter()
            .filter_map(Value::as_str)
            .find(|kind| kind.ends_with("Event")),
        _ => None,
    }
}

fn category_of(node: &Value) -> Option<String> {
    let kind = event_type(node)?;
    let stem = kind.strip_suffix("Event")?;
    base::non_empty(stem)
}

fn string_field(node: &Value, key: &str) -> Option<String> {
    node.get(key).and_then(Value::as_str).map(str::to_string)
}

fn image_of(node: &Value) -> Option<String> {
    match node.get("image")? {
        Value::String(src) => base::non_empty(src),
        Value::Array(items) => items.iter().find_map(|item| match item {
            Value::String(src) => base::non_empty(src),
            other => string_field(other, "url").as_deref().and_then(base::non_empty),
        }),
        other => string_field(other, "url").as_deref().and_then(base::non_empty),
    }
}

fn address_of(address: &Value) -> Option<String> {
    match address {
        Value::String(text) => single_line(text),
        Value::Object(_) => {
            let parts: Vec<String> = ["streetAddress", "addressLocality", "addressRegion"]
                .iter()
                .filter_map(|key| string_field(address, key))
                .filter_map(|part| single_line(&part))
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(", "))
            }
        }
        _ => None,
    }
}

fn apply_open_graph(document: &Html, draft: &mut Draft) {
    fill(
        &mut draft.title,
        base::first_attr(document, &OG_TITLE, "content").as_deref().and_then(single_line),
    );
    fill(
        &mut draft.description,
        base::first_attr(document, &OG_DESCRIPTION, "content"),
    );
    fill(&mut draft.image_url, base::first_attr(document, &OG_IMAGE, "content"));
    fill(&mut draft.date, base::first_attr(document, &OG_START_TIME, "content"));
}

fn apply_dom(document: &Html, hints: &DomHints, draft: &mut Draft) {
    let text_of = |css: &str| -> Option<String> {
        match Selector::parse(css) {
            Ok(selector) => base::first_text(document, &selector),
            Err(err) => {
                debug!("invalid selector {css}: {err:?}");
                None
            }
        }
    };

    fill(&mut draft.title, text_of(hints.title));
    fill(&mut draft.description, text_of(hints.description));
    if let Some(date_css) = hints.date {
        if draft.date.is_none() {
            let date_text = text_of(date_css);
            fill(&mut draft.time, date_text.as_deref().and_then(base::find_first_time));
            draft.date = date_text;
        }
    }
    fill(&mut draft.venue, text_of(hints.venue));
    fill(&mut draft.address, text_of(hints.address));
    if let Some(category_css) = hints.category {
        fill(&mut draft.category, text_of(category_css));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENTBRITE_HTML: &str = r#"
    <html><head>
        <meta property="og:title" content="  Rooftop Cinema: Classics Night  ">
        <meta property="og:description" content="Short teaser">
        <meta property="og:image" content="https://img.evbuc.com/rooftop.jpg">
        <meta property="event:start_time" content="2025-03-07T21:00:00+11:00">
        <script type="application/ld+json">{ "@context": "https://schema.org", "@type": "Organization", "name": "Rooftop Co" }</script>
        <script type="application/ld+json">
        [{
            "@context": "https://schema.org",
            "@type": "ScreeningEvent",
            "name": "Rooftop Cinema: Classics Night",
            "startDate": "2025-03-07T19:30:00+11:00",
            "description": "  Classic films under the stars on a harbourside rooftop.  ",
            "location": {
                "@type": "Place",
                "name": "The Rooftop Bar",
                "address": {
                    "@type": "PostalAddress",
                    "streetAddress": "1 Harbour St",
                    "addressLocality": "Sydney",
                    "addressRegion": "NSW"
                }
            }
        }]
        </script>
    </head>
    <body><h1>Something else entirely</h1><address>Wrong address</address></body></html>
    "#;

    const OFFICIAL_HTML: &str = r#"
    <html><head>
        <meta property="og:image" content="/images/lanterns.jpg">
    </head>
    <body>
        <h1>
            Lunar Lantern   Walk
        </h1>
        <div class="event-date">Sat 1 Feb 2025, 7pm</div>
        <div class="event-description">
            <p>Wander the lantern trail</p> <p>through the city.</p>
        </div>
        <a href="/venues/first-fleet-park">First Fleet Park</a>
        <address> The Rocks, Sydney NSW 2000 </address>
    </body></html>
    "#;

    fn source() -> SourceContext<'static> {
        SourceContext {
            source_website: "Test Source",
            city: "Sydney",
            timezone: chrono_tz::Australia::Sydney,
        }
    }

    fn all_stages() -> ExtractionStrategy {
        ExtractionStrategy {
            structured_data: true,
            open_graph: true,
            dom: Some(DomHints {
                date: Some(r#"div[class*="date"]"#),
                ..DomHints::default()
            }),
            fallback_venue: Some("Sydney location"),
            fallback_address: None,
        }
    }

    #[test]
    fn structured_data_beats_meta_tags_and_dom() {
        let event = extract(
            EVENTBRITE_HTML,
            "https://www.eventbrite.com.au/e/rooftop-123",
            &all_stages(),
            &source(),
        )
        .expect("event extracted");

        assert_eq!(event.title, "Rooftop Cinema: Classics Night");
        assert_eq!(event.date.as_deref(), Some("2025-03-07T19:30:00+11:00"));
        assert_eq!(event.time.as_deref(), Some("7:30 PM"));
        assert_eq!(event.venue.as_deref(), Some("The Rooftop Bar"));
        assert_eq!(
            event.address.as_deref(),
            Some("1 Harbour St, Sydney, NSW")
        );
        assert_eq!(
            event.description.as_deref(),
            Some("Classic films under the stars on a harbourside rooftop.")
        );
        assert_eq!(event.category.as_deref(), Some("Screening"));
        assert_eq!(
            event.image_url.as_deref(),
            Some("https://img.evbuc.com/rooftop.jpg")
        );
        assert_eq!(event.city, "Sydney");
        assert_eq!(event.source_website, "Test Source");
    }

    #[test]
    fn dom_heuristics_fill_what_metadata_lacks() {
        let event = extract(
            OFFICIAL_HTML,
            "https://whatson.example.com/events/lunar-lantern-walk",
            &all_stages(),
            &source(),
        )
        .expect("event extracted");

        assert_eq!(event.title, "Lunar Lantern Walk");
        assert_eq!(event.date.as_deref(), Some("Sat 1 Feb 2025, 7pm"));
        assert_eq!(event.time.as_deref(), Some("7:00 PM"));
        assert_eq!(
            event.description.as_deref(),
            Some("Wander the lantern trail through the city.")
        );
        assert_eq!(event.venue.as_deref(), Some("First Fleet Park"));
        assert_eq!(event.address.as_deref(), Some("The Rocks, Sydney NSW 2000"));
        assert_eq!(
            event.image_url.as_deref(),
            Some("https://whatson.example.com/images/lanterns.jpg")
        );
    }

    #[test]
    fn malformed_structured_data_falls_through() {
        let html = r#"
        <html><head>
            <meta property="og:title" content="Harbour Cruise">
            <meta property="og:start_time" content="2025-04-01T10:00:00+11:00">
            <script type="application/ld+json">{ "@type": "Event", "name": "Broken", </script>
        </head><body></body></html>
        "#;
        let event = extract(html, "https://a.test/e/1", &all_stages(), &source())
            .expect("meta tags still produce a record");
        assert_eq!(event.title, "Harbour Cruise");
        assert_eq!(event.date.as_deref(), Some("2025-04-01T10:00:00+11:00"));
        assert_eq!(event.venue.as_deref(), Some("Sydney location"));
    }

    #[test]
    fn graph_wrapped_events_are_found() {
        let html = r#"
        <script type="application/ld+json">
        {"@context": "https://schema.org", "@graph": [
            {"@type": "WebPage", "name": "Page"},
            {"@type": ["Event", "Thing"], "name": "Night Market",
             "location": [{"name": "Chinatown", "address": "Dixon St, Haymarket"}],
             "image": [{"url": "https://img.test/market.png"}]}
        ]}
        </script>
        "#;
        let event = extract(html, "https://a.test/events/market", &all_stages(), &source())
            .expect("event extracted");
        assert_eq!(event.title, "Night Market");
        assert_eq!(event.venue.as_deref(), Some("Chinatown"));
        assert_eq!(event.address.as_deref(), Some("Dixon St, Haymarket"));
        assert_eq!(event.image_url.as_deref(), Some("https://img.test/market.png"));
        assert_eq!(event.category, None);
    }

    #[test]
    fn pages_without_a_title_are_dropped() {
        let html = r#"<html><head><meta property="og:description" content="no title"></head>
            <body><h1>   </h1><div class="content">Body</div></body></html>"#;
        assert!(extract(html, "https://a.test/e/2", &all_stages(), &source()).is_none());
    }

    #[test]
    fn disabled_stages_are_skipped() {
        let strategy = ExtractionStrategy {
            structured_data: false,
            open_graph: true,
            dom: None,
            fallback_venue: None,
            fallback_address: None,
        };
        let event = extract(EVENTBRITE_HTML, "https://a.test/e/3", &strategy, &source())
            .expect("og title present");
        assert_eq!(event.date.as_deref(), Some("2025-03-07T21:00:00+11:00"));
        assert_eq!(event.description.as_deref(), Some("Short teaser"));
        assert_eq!(event.venue, None);
    }

    #[test]
    fn long_descriptions_are_truncated_with_marker() {
        let body = "x".repeat(MAX_DESCRIPTION_CHARS + 250);
        let html = format!(
            r#"<meta property="og:title" content="Long"><meta property="og:description" content="{body}">"#
        );
        let event = extract(&html, "https://a.test/e/4", &all_stages(), &source())
            .expect("event extracted");
        let description = event.description.expect("description");
        assert_eq!(
            description.chars().count(),
            MAX_DESCRIPTION_CHARS + base::TRUNCATION_MARKER.len()
        );
        assert!(description.ends_with(base::TRUNCATION_MARKER));
    }
}
