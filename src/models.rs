use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    New,
    Updated,
    Inactive,
    /// Set only by the curation workflow.
    Imported,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::New => "new",
            EventStatus::Updated => "updated",
            EventStatus::Inactive => "inactive",
            EventStatus::Imported => "imported",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "new" => Ok(EventStatus::New),
            "updated" => Ok(EventStatus::Updated),
            "inactive" => Ok(EventStatus::Inactive),
            "imported" => Ok(EventStatus::Imported),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A record as produced by the field extractor, before it meets the store.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ExtractedEvent {
    pub original_url: String,
    pub title: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub city: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub source_website: String,
}

impl ExtractedEvent {
    /// Hash over the descriptive fields; identical extractions hash identically.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            Some(self.title.as_str()),
            self.date.as_deref(),
            self.time.as_deref(),
            self.venue.as_deref(),
            self.address.as_deref(),
            Some(self.city.as_str()),
            self.description.as_deref(),
            self.category.as_deref(),
            self.image_url.as_deref(),
            Some(self.source_website.as_str()),
        ] {
            hasher.update(part.unwrap_or("").as_bytes());
            hasher.update(b"|");
        }
        format!("{:x}", hasher.finalize())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct EventRecord {
    pub id: i64,
    pub original_url: String,
    pub title: String,
    pub date: Option<String>,
    pub time: Option<String>,
    pub venue: Option<String>,
    pub address: Option<String>,
    pub city: String,
    pub description: Option<String>,
    pub category: Option<String>,
    pub image_url: Option<String>,
    pub source_website: String,
    pub status: EventStatus,
    pub last_scraped: DateTime<Utc>,
    pub imported_at: Option<DateTime<Utc>>,
    pub imported_by: Option<String>,
    pub import_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub scrape_count: i64,
    pub last_seen_run: Option<i64>,
    pub content_hash: String,
}

/// Per-source slice of a crawl run.
#[derive(Serialize, Clone, Debug, Default)]
pub struct SourceReport {
    pub source_id: String,
    pub links_found: usize,
    pub visited: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub marked_inactive: usize,
    /// Set when the listing page could not be processed.
    pub listing_error: Option<String>,
}

#[derive(Serialize, Clone, Debug, Default)]
pub struct CrawlReport {
    pub run_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub visited: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Links dropped because no title could be extracted.
    pub skipped: usize,
    pub created: usize,
    pub updated: usize,
    pub marked_inactive: usize,
    pub cancelled: bool,
    pub sources: Vec<SourceReport>,
}

impl CrawlReport {
    pub fn absorb(&mut self, source: SourceReport) {
        self.visited += source.visited;
        self.succeeded += source.succeeded;
        self.failed += source.failed;
        self.skipped += source.skipped;
        self.created += source.created;
        self.updated += source.updated;
        self.marked_inactive += source.marked_inactive;
        self.sources.push(source);
    }
}
