//! # Embedded Event Store
//!
//! Durable, deduplicating repository for canonical events plus the auxiliary
//! telemetry tables (request logs, rollups, rate-limit counters, feed events,
//! client-count history, persisted config). A single `rusqlite` connection
//! behind a mutex keeps the engine single-writer; the rate limiter, metrics
//! and settings modules issue their own statements through [`Store::with_conn`].

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;

use crate::model::{Event, Source};

/// Custom error types for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to open database: {0}")]
    OpenError(String),
    #[error("Query execution failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Default page size for `list` when the caller does not ask for one.
pub const DEFAULT_LIST_LIMIT: usize = 20;
/// Hard ceiling for `list` page sizes.
pub const MAX_LIST_LIMIT: usize = 500;

/// Filters for [`Store::list`]; all present filters combine with AND.
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub source: Option<Source>,
    pub r#type: Option<String>,
    pub limit: Option<usize>,
}

/// Row-count snapshot for one table, used by the admin dashboard.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TableStat {
    pub table: String,
    pub rows: i64,
}

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if necessary) the database at `path` and ensures the
    /// schema. Schema creation is idempotent.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| StoreError::OpenError(e.to_string()))?;
        Self::from_connection(conn)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::OpenError(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        init_schema(&conn)?;
        migrate(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Runs `f` against the shared connection. Serializes all store access.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> Result<T, StoreError> {
        let mut conn = self.lock();
        f(&mut conn).map_err(StoreError::from)
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    /// Inserts a batch in one transaction. Rows whose `event_id` already
    /// exists are silently ignored; the returned count reports rows that
    /// actually materialized. Batch order is preserved.
    pub fn insert(&self, events: &[Event]) -> Result<usize, StoreError> {
        Ok(self.insert_fresh(events)?.len())
    }

    /// Like [`insert`](Self::insert) but returns the ids of the rows that
    /// materialized, so callers can act on exactly the new events.
    pub fn insert_fresh(&self, events: &[Event]) -> Result<Vec<String>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut fresh = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO events (
                    event_id, source, receive_source, type, report_type,
                    time, issue_time, receive_time,
                    latitude, longitude, magnitude, depth, intensity,
                    region, advisory, revision
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            )?;
            for e in events {
                let report_type = e
                    .report_type
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default());
                let changed = stmt.execute(params![
                    e.event_id,
                    e.source.as_str(),
                    e.receive_source,
                    e.r#type,
                    report_type,
                    e.time.to_rfc3339(),
                    e.issue_time.map(|t| t.to_rfc3339()),
                    e.receive_time.to_rfc3339(),
                    e.latitude,
                    e.longitude,
                    e.magnitude,
                    e.depth,
                    e.intensity,
                    e.region,
                    e.advisory,
                    e.revision,
                ])?;
                if changed == 1 {
                    fresh.push(e.event_id.clone());
                }
            }
        }
        tx.commit()?;
        Ok(fresh)
    }

    /// The event with the greatest origin time, if any.
    pub fn latest(&self) -> Result<Option<Event>, StoreError> {
        let conn = self.lock();
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY time DESC LIMIT 1"),
                [],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// The event with the smallest origin time, if any.
    pub fn oldest(&self) -> Result<Option<Event>, StoreError> {
        let conn = self.lock();
        let event = conn
            .query_row(
                &format!("SELECT {EVENT_COLUMNS} FROM events ORDER BY time ASC LIMIT 1"),
                [],
                row_to_event,
            )
            .optional()?;
        Ok(event)
    }

    /// Filtered listing, strictly `time` descending.
    pub fn list(&self, query: &EventQuery) -> Result<Vec<Event>, StoreError> {
        let mut clauses: Vec<&str> = Vec::new();
        let mut binds: Vec<String> = Vec::new();
        if let Some(since) = &query.since {
            clauses.push("time >= ?");
            binds.push(since.to_rfc3339());
        }
        if let Some(until) = &query.until {
            clauses.push("time <= ?");
            binds.push(until.to_rfc3339());
        }
        if let Some(source) = &query.source {
            clauses.push("source = ?");
            binds.push(source.as_str().to_string());
        }
        if let Some(kind) = &query.r#type {
            clauses.push("type = ?");
            binds.push(kind.clone());
        }
        let where_sql = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let limit = query
            .limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM events{where_sql} ORDER BY time DESC LIMIT {limit}"
        );

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(binds.iter()), row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    /// Most recent `limit` events, oldest-first, for the backup projection.
    pub fn recent(&self, limit: usize) -> Result<Vec<Event>, StoreError> {
        let limit = limit.clamp(1, 1000);
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY time DESC LIMIT {limit}"
        ))?;
        let rows = stmt.query_map([], row_to_event)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        events.reverse();
        Ok(events)
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?)
    }

    pub fn count_by_source(&self, source: Source) -> Result<i64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM events WHERE source = ?1",
            params![source.as_str()],
            |r| r.get(0),
        )?)
    }

    /// Per-source event totals, for metrics export and the dashboard.
    pub fn source_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT source, COUNT(*) FROM events GROUP BY source ORDER BY source")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
        let mut counts = Vec::new();
        for row in rows {
            counts.push(row?);
        }
        Ok(counts)
    }

    /// Events whose origin time falls within the trailing `secs` seconds.
    pub fn count_since(&self, cutoff: DateTime<Utc>) -> Result<i64, StoreError> {
        let conn = self.lock();
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM events WHERE time >= ?1",
            params![cutoff.to_rfc3339()],
            |r| r.get(0),
        )?)
    }

    /// Deletes events older than `days`; returns the number removed.
    pub fn delete_older_than(&self, days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let conn = self.lock();
        Ok(conn.execute(
            "DELETE FROM events WHERE time < ?1",
            params![cutoff.to_rfc3339()],
        )?)
    }

    /// Row counts for every table the engine owns.
    pub fn table_stats(&self) -> Result<Vec<TableStat>, StoreError> {
        let conn = self.lock();
        let mut stats = Vec::new();
        for table in [
            "events",
            "request_logs",
            "metrics_rollup",
            "rate_limits",
            "feed_events",
            "ws_client_history",
            "config",
        ] {
            let rows: i64 =
                conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))?;
            stats.push(TableStat { table: table.to_string(), rows });
        }
        Ok(stats)
    }
}

const EVENT_COLUMNS: &str = "event_id, source, receive_source, type, report_type, \
     time, issue_time, receive_time, latitude, longitude, magnitude, depth, intensity, \
     region, advisory, revision";

fn parse_ts(row_index: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                row_index,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let source_raw: String = row.get(1)?;
    let source = Source::parse(&source_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            rusqlite::types::Type::Text,
            format!("unknown source {source_raw}").into(),
        )
    })?;
    let report_type: Option<String> = row.get(4)?;
    let time_raw: String = row.get(5)?;
    let issue_raw: Option<String> = row.get(6)?;
    let receive_raw: String = row.get(7)?;

    Ok(Event {
        event_id: row.get(0)?,
        source,
        receive_source: row.get(2)?,
        r#type: row.get(3)?,
        report_type: report_type.and_then(|s| serde_json::from_str(&s).ok()),
        time: parse_ts(5, &time_raw)?,
        issue_time: match issue_raw {
            Some(raw) => Some(parse_ts(6, &raw)?),
            None => None,
        },
        receive_time: parse_ts(7, &receive_raw)?,
        latitude: row.get(8)?,
        longitude: row.get(9)?,
        magnitude: row.get(10)?,
        depth: row.get(11)?,
        intensity: row.get(12)?,
        region: row.get(13)?,
        advisory: row.get(14)?,
        revision: row.get(15)?,
    })
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            event_id       TEXT PRIMARY KEY,
            source         TEXT NOT NULL,
            receive_source TEXT NOT NULL,
            type           TEXT NOT NULL,
            report_type    TEXT,
            time           TEXT NOT NULL,
            issue_time     TEXT,
            receive_time   TEXT NOT NULL,
            latitude       REAL,
            longitude      REAL,
            magnitude      REAL,
            depth          REAL,
            region         TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_events_time ON events(time);
        CREATE INDEX IF NOT EXISTS idx_events_source ON events(source);

        CREATE TABLE IF NOT EXISTS request_logs (
            id          INTEGER PRIMARY KEY AUTOINCREMENT,
            ts          TEXT NOT NULL,
            endpoint    TEXT NOT NULL,
            method      TEXT NOT NULL,
            status      INTEGER NOT NULL,
            duration_ms REAL NOT NULL,
            ip          TEXT NOT NULL,
            user_agent  TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_request_logs_ts ON request_logs(ts);

        CREATE TABLE IF NOT EXISTS metrics_rollup (
            ts               TEXT NOT NULL,
            interval_seconds INTEGER NOT NULL,
            metric_name      TEXT NOT NULL,
            labels           TEXT NOT NULL,
            value            REAL NOT NULL,
            count            INTEGER NOT NULL,
            PRIMARY KEY (ts, interval_seconds, metric_name, labels)
        );

        CREATE TABLE IF NOT EXISTS rate_limits (
            ip           TEXT NOT NULL,
            endpoint     TEXT NOT NULL,
            count        INTEGER NOT NULL,
            window_start INTEGER NOT NULL,
            PRIMARY KEY (ip, endpoint)
        );

        CREATE TABLE IF NOT EXISTS feed_events (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            ts      TEXT NOT NULL,
            feed    TEXT NOT NULL,
            event   TEXT NOT NULL,
            details TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_feed_events_ts ON feed_events(ts);

        CREATE TABLE IF NOT EXISTS ws_client_history (
            ts    TEXT PRIMARY KEY,
            count INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS config (
            key        TEXT PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

/// Additive column migration, tolerant of columns that already exist.
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    for (column, decl) in [
        ("intensity", "REAL"),
        ("advisory", "TEXT"),
        ("revision", "TEXT"),
    ] {
        ensure_column(conn, "events", column, decl)?;
    }
    Ok(())
}

fn ensure_column(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let existing: Vec<String> = stmt
        .query_map([], |r| r.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;
    if !existing.iter().any(|c| c == column) {
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"))?;
    }
    Ok(())
}
