use chrono::DateTime;
use chrono_tz::Tz;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

static TIME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(\d{1,2})(?::(\d{2}))?\s*(am|pm)\b").expect("valid time regex")
});

pub const TRUNCATION_MARKER: &str = "...";

pub fn clean_text(input: &str) -> String {
    input.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trims and drops empty values.
pub fn non_empty(input: &str) -> Option<String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn inner_text(element: ElementRef<'_>) -> String {
    clean_text(&element.text().collect::<Vec<_>>().join(" "))
}

/// Text of the first match that has any text at all.
pub fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document
        .select(selector)
        .map(inner_text)
        .find(|text| !text.is_empty())
}

pub fn first_attr(document: &Html, selector: &Selector, attr: &str) -> Option<String> {
    document
        .select(selector)
        .filter_map(|el| el.value().attr(attr))
        .find_map(non_empty)
}

pub fn absolute_url(base: &str, href: &str) -> Option<Url> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    if let Ok(url) = Url::parse(href) {
        return Some(url);
    }
    let base_url = Url::parse(base).ok()?;
    base_url.join(href).ok()
}

pub fn find_first_time(text: &str) -> Option<String> {
    let cleaned = clean_text(text);
    let caps = TIME_RE.captures(&cleaned)?;
    let hour = caps.get(1)?.as_str().parse::<u32>().ok()?;
    if !(1..=12).contains(&hour) {
        return None;
    }
    let minute = caps
        .get(2)
        .map(|m| m.as_str().parse::<u32>().unwrap_or(0))
        .unwrap_or(0);
    let period = caps.get(3)?.as_str().to_uppercase();
    Some(format!("{}:{:02} {}", hour, minute, period))
}

/// Clock time of an RFC 3339 timestamp, rendered in the source's timezone.
pub fn local_time_of(timestamp: &str, tz: Tz) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(timestamp.trim()).ok()?;
    Some(parsed.with_timezone(&tz).format("%-I:%M %p").to_string())
}

/// Cuts `input` to at most `max_chars` characters, appending the marker only
/// when something was removed.
pub fn truncate_chars(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        None => input.to_string(),
        Some((cut, _)) => {
            let mut out = input[..cut].to_string();
            out.push_str(TRUNCATION_MARKER);
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_counts_characters_not_bytes() {
        let long = "é".repeat(1200);
        let cut = truncate_chars(&long, 1000);
        assert_eq!(cut.chars().count(), 1000 + TRUNCATION_MARKER.len());
        assert!(cut.ends_with(TRUNCATION_MARKER));

        let exact = "a".repeat(1000);
        assert_eq!(truncate_chars(&exact, 1000), exact);
    }

    #[test]
    fn finds_clock_times_in_free_text() {
        assert_eq!(
            find_first_time("Sat 1 Mar, 7pm - 10:30pm").as_deref(),
            Some("7:00 PM")
        );
        assert_eq!(find_first_time("Doors 6:30 am").as_deref(), Some("6:30 AM"));
        assert_eq!(find_first_time("All day"), None);
    }

    #[test]
    fn renders_iso_times_in_source_zone() {
        assert_eq!(
            local_time_of("2025-03-01T08:00:00Z", chrono_tz::Australia::Sydney).as_deref(),
            Some("7:00 PM")
        );
        assert_eq!(local_time_of("Saturday", chrono_tz::Australia::Sydney), None);
    }

    #[test]
    fn resolves_relative_links() {
        let url = absolute_url("https://whatson.example.com/events", "/events/lantern-walk")
            .expect("joined");
        assert_eq!(url.as_str(), "https://whatson.example.com/events/lantern-walk");
        assert!(absolute_url("https://a.test/", "   ").is_none());
    }
}
