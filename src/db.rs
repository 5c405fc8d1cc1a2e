use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql, TransactionBehavior};

use crate::config::DatabaseLocation;
use crate::models::{CrawlReport, EventRecord, EventStatus, ExtractedEvent};
use crate::utils;

const EVENT_COLUMNS: &str = "id, original_url, title, date, time, venue, address, city, description,
     category, image_url, source_website, status, last_scraped, imported_at, imported_by,
     import_notes, created_at, updated_at, scrape_count, last_seen_run, content_hash";

/// SQLite-backed event store. Safe to share across tasks behind an `Arc`.
pub struct Store {
    conn: Mutex<Connection>,
}

/// Result of an upsert, reported by the storage engine in the same transaction.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub created: bool,
    pub content_changed: bool,
    pub record: EventRecord,
}

#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub status: Option<EventStatus>,
    pub city: Option<String>,
    pub keyword: Option<String>,
    pub source_website: Option<String>,
    pub scraped_after: Option<DateTime<Utc>>,
    pub scraped_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl Store {
    pub fn open(location: &DatabaseLocation) -> rusqlite::Result<Self> {
        match location {
            DatabaseLocation::Memory => Self::open_in_memory(),
            DatabaseLocation::File(path) => Self::open_path(path),
        }
    }

    pub fn open_path(path: &Path) -> rusqlite::Result<Self> {
        utils::ensure_parent(path);
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> rusqlite::Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> rusqlite::Result<Self> {
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS events(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                original_url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL CHECK(length(title) > 0),
                date TEXT,
                time TEXT,
                venue TEXT,
                address TEXT,
                city TEXT NOT NULL,
                description TEXT,
                category TEXT,
                image_url TEXT,
                source_website TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'new'
                    CHECK(status IN ('new', 'updated', 'inactive', 'imported')),
                last_scraped TEXT NOT NULL,
                imported_at TEXT,
                imported_by TEXT,
                import_notes TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                scrape_count INTEGER NOT NULL DEFAULT 1,
                last_seen_run INTEGER,
                content_hash TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS events_source_status ON events(source_website, status);
            CREATE INDEX IF NOT EXISTS events_last_scraped ON events(last_scraped);
            CREATE TABLE IF NOT EXISTS crawl_runs(
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                visited INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0,
                skipped INTEGER NOT NULL DEFAULT 0,
                cancelled INTEGER NOT NULL DEFAULT 0,
                error TEXT
            );
            CREATE TABLE IF NOT EXISTS source_runs(
                run_id INTEGER NOT NULL,
                source_website TEXT NOT NULL,
                links_found INTEGER NOT NULL,
                PRIMARY KEY (run_id, source_website)
            );",
        )?;
        Ok(())
    }

    /// Inserts or refreshes the record keyed by `original_url`.
    ///
    /// New rows start as `new`; existing rows become `updated` unless they were
    /// `imported`, which the pipeline never overwrites. Curation columns are
    /// never written here.
    pub fn upsert_event(
        &self,
        event: &ExtractedEvent,
        seen_in_run: Option<i64>,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<UpsertOutcome> {
        let hash = event.content_hash();
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous_hash: Option<String> = tx
            .query_row(
                "SELECT content_hash FROM events WHERE original_url = ?1",
                params![event.original_url],
                |row| row.get(0),
            )
            .optional()?;

        let sql = format!(
            "INSERT INTO events (original_url, title, date, time, venue, address, city,
                description, category, image_url, source_website, status, last_scraped,
                created_at, updated_at, scrape_count, last_seen_run, content_hash)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 'new', ?12, ?12, ?12, 1, ?13, ?14)
             ON CONFLICT(original_url) DO UPDATE SET
               title = excluded.title,
               date = excluded.date,
               time = excluded.time,
               venue = excluded.venue,
               address = excluded.address,
               city = excluded.city,
               description = excluded.description,
               category = excluded.category,
               image_url = excluded.image_url,
               source_website = excluded.source_website,
               status = CASE WHEN events.status = 'imported' THEN 'imported' ELSE 'updated' END,
               last_scraped = excluded.last_scraped,
               updated_at = excluded.updated_at,
               scrape_count = events.scrape_count + 1,
               last_seen_run = COALESCE(excluded.last_seen_run, events.last_seen_run),
               content_hash = excluded.content_hash
             RETURNING {EVENT_COLUMNS}"
        );
        let record = tx.query_row(
            &sql,
            params![
                event.original_url,
                event.title,
                event.date,
                event.time,
                event.venue,
                event.address,
                event.city,
                event.description,
                event.category,
                event.image_url,
                event.source_website,
                now,
                seen_in_run,
                hash,
            ],
            row_to_record,
        )?;
        tx.commit()?;

        Ok(UpsertOutcome {
            created: record.scrape_count == 1,
            content_changed: previous_hash.map_or(true, |prev| prev != hash),
            record,
        })
    }

    pub fn get_event(&self, original_url: &str) -> rusqlite::Result<Option<EventRecord>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE original_url = ?1");
        self.conn()
            .query_row(&sql, params![original_url], row_to_record)
            .optional()
    }

    pub fn count_events(&self) -> rusqlite::Result<i64> {
        self.conn()
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
    }

    pub fn list_events(&self, filter: &EventFilter) -> rusqlite::Result<Vec<EventRecord>> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut values: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Box::new(status.as_str()));
        }
        if let Some(city) = filter.city.as_deref().filter(|c| !c.trim().is_empty()) {
            clauses.push("city LIKE ?");
            values.push(Box::new(format!("%{}%", city.trim())));
        }
        if let Some(keyword) = filter.keyword.as_deref().filter(|k| !k.trim().is_empty()) {
            clauses.push("(title LIKE ? OR venue LIKE ? OR description LIKE ?)");
            let pattern = format!("%{}%", keyword.trim());
            values.push(Box::new(pattern.clone()));
            values.push(Box::new(pattern.clone()));
            values.push(Box::new(pattern));
        }
        if let Some(source) = filter.source_website.as_deref() {
            clauses.push("source_website = ?");
            values.push(Box::new(source.to_string()));
        }
        if let Some(after) = filter.scraped_after {
            clauses.push("last_scraped >= ?");
            values.push(Box::new(after));
        }
        if let Some(before) = filter.scraped_before {
            clauses.push("last_scraped <= ?");
            values.push(Box::new(before));
        }

        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY last_scraped DESC, id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            values.push(Box::new(limit as i64));
        }

        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = values.iter().map(|value| value.as_ref()).collect();
        let rows = stmt.query_map(params.as_slice(), row_to_record)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Curation hook: the only place `imported` is ever written.
    pub fn mark_imported(
        &self,
        original_url: &str,
        imported_by: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<Option<EventRecord>> {
        let changed = self.conn().execute(
            "UPDATE events SET status = 'imported', imported_at = ?2, imported_by = ?3,
                import_notes = ?4, updated_at = ?2
             WHERE original_url = ?1",
            params![original_url, now, imported_by, notes],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        self.get_event(original_url)
    }

    /// Stamps `last_seen_run` on existing records whose links were discovered.
    pub fn mark_seen(&self, urls: &[String], run_id: i64) -> rusqlite::Result<usize> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        let mut touched = 0;
        {
            let mut stmt =
                tx.prepare("UPDATE events SET last_seen_run = ?2 WHERE original_url = ?1")?;
            for url in urls {
                touched += stmt.execute(params![url, run_id])?;
            }
        }
        tx.commit()?;
        Ok(touched)
    }

    pub fn record_source_run(
        &self,
        run_id: i64,
        source_website: &str,
        links_found: usize,
    ) -> rusqlite::Result<()> {
        self.conn().execute(
            "INSERT OR REPLACE INTO source_runs (run_id, source_website, links_found)
             VALUES (?1, ?2, ?3)",
            params![run_id, source_website, links_found as i64],
        )?;
        Ok(())
    }

    /// Marks `new`/`updated` records of a source inactive when they were not
    /// seen in any of the source's last `window` successful listing crawls.
    /// Does nothing until the source has that many recorded crawls.
    pub fn mark_stale_inactive(
        &self,
        source_website: &str,
        window: usize,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<usize> {
        if window == 0 {
            return Ok(0);
        }
        let conn = self.conn();
        let threshold: Option<i64> = conn
            .query_row(
                "SELECT run_id FROM source_runs WHERE source_website = ?1
                 ORDER BY run_id DESC LIMIT 1 OFFSET ?2",
                params![source_website, (window - 1) as i64],
                |row| row.get(0),
            )
            .optional()?;
        let Some(threshold) = threshold else {
            return Ok(0);
        };
        conn.execute(
            "UPDATE events SET status = 'inactive', updated_at = ?3
             WHERE source_website = ?1
               AND status IN ('new', 'updated')
               AND (last_seen_run IS NULL OR last_seen_run < ?2)",
            params![source_website, threshold, now],
        )
    }

    /// Opens a run unless another unfinished run started within `stale_after`.
    /// Returns `None` when a run is already in progress.
    pub fn begin_run(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> rusqlite::Result<Option<i64>> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let active: Option<i64> = tx
            .query_row(
                "SELECT id FROM crawl_runs WHERE finished_at IS NULL AND started_at > ?1
                 ORDER BY id DESC LIMIT 1",
                params![now - stale_after],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Ok(None);
        }
        tx.execute(
            "INSERT INTO crawl_runs (started_at) VALUES (?1)",
            params![now],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(Some(id))
    }

    /// `(finished, cancelled)` for a run row, `None` if no such run exists.
    pub fn run_status(&self, run_id: i64) -> rusqlite::Result<Option<(bool, bool)>> {
        self.conn()
            .query_row(
                "SELECT finished_at IS NOT NULL, cancelled FROM crawl_runs WHERE id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
    }

    pub fn finish_run(
        &self,
        run_id: i64,
        report: Option<&CrawlReport>,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) -> rusqlite::Result<()> {
        let (visited, succeeded, failed, skipped, cancelled) = report
            .map(|r| (r.visited, r.succeeded, r.failed, r.skipped, r.cancelled))
            .unwrap_or_default();
        self.conn().execute(
            "UPDATE crawl_runs SET finished_at = ?2, visited = ?3, succeeded = ?4, failed = ?5,
                skipped = ?6, cancelled = ?7, error = ?8
             WHERE id = ?1",
            params![
                run_id,
                now,
                visited as i64,
                succeeded as i64,
                failed as i64,
                skipped as i64,
                cancelled,
                error
            ],
        )?;
        Ok(())
    }
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let status_text: String = row.get(12)?;
    let status = status_text.parse::<EventStatus>().map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(
            12,
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, err)),
        )
    })?;
    Ok(EventRecord {
        id: row.get(0)?,
        original_url: row.get(1)?,
        title: row.get(2)?,
        date: row.get(3)?,
        time: row.get(4)?,
        venue: row.get(5)?,
        address: row.get(6)?,
        city: row.get(7)?,
        description: row.get(8)?,
        category: row.get(9)?,
        image_url: row.get(10)?,
        source_website: row.get(11)?,
        status,
        last_scraped: row.get(13)?,
        imported_at: row.get(14)?,
        imported_by: row.get(15)?,
        import_notes: row.get(16)?,
        created_at: row.get(17)?,
        updated_at: row.get(18)?,
        scrape_count: row.get(19)?,
        last_seen_run: row.get(20)?,
        content_hash: row.get(21)?,
    })
}
