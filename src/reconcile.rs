use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::db::Store;
use crate::models::{EventRecord, ExtractedEvent};

#[derive(Debug, Clone)]
pub struct Reconciled {
    pub created: bool,
    /// False when the stored descriptive fields were already identical.
    pub content_changed: bool,
    pub record: EventRecord,
}

/// Merges extracted records into the store under the status policy:
/// first sight is `new`, later sights are `updated`, and `imported` is kept.
pub struct Reconciler {
    store: Arc<Store>,
    run_id: Option<i64>,
}

impl Reconciler {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            run_id: None,
        }
    }

    /// Records reconciled through this instance count as seen in `run_id`.
    pub fn for_run(store: Arc<Store>, run_id: i64) -> Self {
        Self {
            store,
            run_id: Some(run_id),
        }
    }

    pub fn reconcile(&self, event: &ExtractedEvent) -> rusqlite::Result<Reconciled> {
        let outcome = self.store.upsert_event(event, self.run_id, Utc::now())?;
        debug!(
            "reconciled {} (created={}, changed={}, status={})",
            event.original_url, outcome.created, outcome.content_changed, outcome.record.status
        );
        Ok(Reconciled {
            created: outcome.created,
            content_changed: outcome.content_changed,
            record: outcome.record,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EventStatus;

    fn extracted(url: &str, title: &str) -> ExtractedEvent {
        ExtractedEvent {
            original_url: url.to_string(),
            title: title.to_string(),
            date: Some("2025-03-01T19:00:00+11:00".into()),
            time: Some("7:00 PM".into()),
            venue: Some("Sydney Town Hall".into()),
            address: Some("483 George St, Sydney, NSW".into()),
            city: "Sydney".into(),
            description: Some("An evening of choral music.".into()),
            category: Some("Music".into()),
            image_url: None,
            source_website: "Eventbrite".into(),
        }
    }

    fn reconciler() -> Reconciler {
        Reconciler::new(Arc::new(Store::open_in_memory().expect("in-memory store")))
    }

    #[test]
    fn second_reconcile_updates_in_place() {
        let reconciler = reconciler();
        let url = "https://www.eventbrite.com.au/e/choir-1";

        let first = reconciler
            .reconcile(&extracted(url, "Choir Night"))
            .expect("first reconcile");
        assert!(first.created);
        assert_eq!(first.record.status, EventStatus::New);

        let second = reconciler
            .reconcile(&extracted(url, "Choir Night (Sold Out)"))
            .expect("second reconcile");
        assert!(!second.created);
        assert!(second.content_changed);
        assert_eq!(second.record.id, first.record.id);
        assert_eq!(second.record.status, EventStatus::Updated);
        assert_eq!(second.record.title, "Choir Night (Sold Out)");
        assert!(second.record.last_scraped >= first.record.last_scraped);
        assert_eq!(reconciler.store.count_events().expect("count"), 1);
    }

    #[test]
    fn identical_content_is_reported_unchanged() {
        let reconciler = reconciler();
        let event = extracted("https://www.eventbrite.com.au/e/choir-2", "Choir Night");
        reconciler.reconcile(&event).expect("first");
        let again = reconciler.reconcile(&event).expect("second");
        assert!(!again.content_changed);
        assert_eq!(again.record.status, EventStatus::Updated);
        assert_eq!(again.record.scrape_count, 2);
    }

    #[test]
    fn imported_records_keep_their_status_and_curation() {
        let reconciler = reconciler();
        let url = "https://www.eventbrite.com.au/e/choir-3";
        reconciler
            .reconcile(&extracted(url, "Choir Night"))
            .expect("first");
        reconciler
            .store
            .mark_imported(url, "curator@example.com", Some("front page"), Utc::now())
            .expect("import")
            .expect("record exists");

        let refreshed = reconciler
            .reconcile(&extracted(url, "Choir Night: Encore"))
            .expect("reconcile after import");
        assert_eq!(refreshed.record.status, EventStatus::Imported);
        assert_eq!(refreshed.record.title, "Choir Night: Encore");
        assert_eq!(
            refreshed.record.imported_by.as_deref(),
            Some("curator@example.com")
        );
        assert_eq!(refreshed.record.import_notes.as_deref(), Some("front page"));
        assert!(refreshed.record.imported_at.is_some());
    }

    #[test]
    fn run_id_is_stamped_on_reconciled_records() {
        let store = Arc::new(Store::open_in_memory().expect("store"));
        let run_id = store
            .begin_run(Utc::now(), chrono::Duration::hours(2))
            .expect("begin")
            .expect("no run in progress");
        let reconciler = Reconciler::for_run(store.clone(), run_id);
        let outcome = reconciler
            .reconcile(&extracted("https://www.eventbrite.com.au/e/choir-4", "Choir"))
            .expect("reconcile");
        assert_eq!(outcome.record.last_seen_run, Some(run_id));
    }
}
