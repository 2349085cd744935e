//! Request, feed and client telemetry with periodic rollup and retention.
//!
//! Three capture paths feed the auxiliary tables: per-request logs, feed
//! lifecycle events and minute-bucket WebSocket client samples. A rollup pass
//! aggregates closed windows of raw request logs into `metrics_rollup`
//! (idempotent upserts, so replaying a window is safe), and a cleanup pass
//! applies the retention policy. Both are gated on monotonic last-run
//! timestamps so callers can invoke them opportunistically.

use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;
use serde_json::{json, Value};

use crate::settings::SettingsManager;
use crate::store::{Store, StoreError};

/// Client-count history retention.
const WS_HISTORY_RETENTION_HOURS: i64 = 24;
/// Feed event log retention.
const FEED_EVENT_RETENTION_DAYS: i64 = 7;
/// Window for the JSON export's sliding latency percentiles.
const PERCENTILE_WINDOW_SECS: i64 = 300;

/// One completed HTTP request, as observed by the middleware.
#[derive(Debug, Clone)]
pub struct RequestLog {
    pub ts: DateTime<Utc>,
    pub endpoint: String,
    pub method: String,
    pub status: u16,
    pub duration_ms: f64,
    pub ip: String,
    pub user_agent: Option<String>,
}

/// Live values the exports need from outside the store: assembled by the
/// HTTP layer from the hub, ingest and feed snapshots.
#[derive(Debug, Clone, Default)]
pub struct ExportContext {
    pub events_by_source: Vec<(String, i64)>,
    pub ws_clients: usize,
    pub heartbeat_age_secs: Option<f64>,
    /// (feed name, currently connected).
    pub feeds: Vec<(String, bool)>,
}

pub struct Metrics {
    store: Arc<Store>,
    settings: Arc<SettingsManager>,
    last_rollup: Mutex<i64>,
    last_cleanup: Mutex<i64>,
}

impl Metrics {
    pub fn new(store: Arc<Store>, settings: Arc<SettingsManager>) -> Self {
        Self {
            store,
            settings,
            last_rollup: Mutex::new(0),
            last_cleanup: Mutex::new(0),
        }
    }

    pub fn log_request(&self, entry: &RequestLog) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO request_logs (ts, endpoint, method, status, duration_ms, ip, user_agent)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.ts.to_rfc3339(),
                    entry.endpoint,
                    entry.method,
                    entry.status,
                    entry.duration_ms,
                    entry.ip,
                    entry.user_agent,
                ],
            )?;
            Ok(())
        })
    }

    pub fn record_feed_event(
        &self,
        feed: &str,
        event: &str,
        details: Option<&str>,
    ) -> Result<(), StoreError> {
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO feed_events (ts, feed, event, details) VALUES (?1, ?2, ?3, ?4)",
                params![Utc::now().to_rfc3339(), feed, event, details],
            )?;
            Ok(())
        })
    }

    /// One row per minute, last writer wins.
    pub fn record_ws_client_count(&self, count: usize) -> Result<(), StoreError> {
        let minute = Utc::now().format("%Y-%m-%dT%H:%M").to_string();
        self.store.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ws_client_history (ts, count) VALUES (?1, ?2)
                 ON CONFLICT(ts) DO UPDATE SET count = excluded.count",
                params![minute, count as i64],
            )?;
            Ok(())
        })
    }

    /// Last `limit` minute buckets, oldest first.
    pub fn ws_history(&self, limit: usize) -> Result<Vec<(String, i64)>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ts, count FROM ws_client_history ORDER BY ts DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
            })?;
            let mut history: Vec<(String, i64)> = rows.collect::<rusqlite::Result<_>>()?;
            history.reverse();
            Ok(history)
        })
    }

    /// Total rate-limited responses, for the dashboard.
    pub fn count_429(&self) -> Result<i64, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM request_logs WHERE status = 429",
                [],
                |r| r.get(0),
            )
        })
    }

    /// Runs the rollup when at least one interval elapsed since the last run.
    pub fn maybe_rollup(&self) -> Result<bool, StoreError> {
        let interval = self.settings.get().rollup_interval_secs();
        let now = Utc::now().timestamp();
        {
            let mut last = self.last_rollup.lock().expect("metrics lock poisoned");
            if now - *last < interval {
                return Ok(false);
            }
            *last = now;
        }
        self.perform_rollup()?;
        Ok(true)
    }

    pub fn perform_rollup(&self) -> Result<(), StoreError> {
        self.perform_rollup_at(Utc::now())
    }

    /// Aggregates the closed window `[window_start - interval, window_start)`
    /// into `metrics_rollup`. Upserts keyed on the composite PK make a replay
    /// of the same window a no-op.
    pub fn perform_rollup_at(&self, now: DateTime<Utc>) -> Result<(), StoreError> {
        let interval = self.settings.get().rollup_interval_secs();
        let now_ts = now.timestamp();
        let current_window = now_ts - now_ts.rem_euclid(interval);
        let start = DateTime::<Utc>::from_timestamp(current_window - interval, 0)
            .unwrap_or(now);
        let end = DateTime::<Utc>::from_timestamp(current_window, 0).unwrap_or(now);
        let window_ts = start.to_rfc3339();

        self.store.with_conn(|conn| {
            let mut by_status = conn.prepare(
                "SELECT endpoint, status, COUNT(*) FROM request_logs
                 WHERE ts >= ?1 AND ts < ?2 GROUP BY endpoint, status",
            )?;
            let counts: Vec<(String, i64, i64)> = by_status
                .query_map(params![start.to_rfc3339(), end.to_rfc3339()], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut by_endpoint = conn.prepare(
                "SELECT endpoint, AVG(duration_ms), COUNT(*) FROM request_logs
                 WHERE ts >= ?1 AND ts < ?2 GROUP BY endpoint",
            )?;
            let durations: Vec<(String, f64, i64)> = by_endpoint
                .query_map(params![start.to_rfc3339(), end.to_rfc3339()], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?))
                })?
                .collect::<rusqlite::Result<_>>()?;

            let mut upsert = conn.prepare(
                "INSERT INTO metrics_rollup (ts, interval_seconds, metric_name, labels, value, count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(ts, interval_seconds, metric_name, labels)
                 DO UPDATE SET value = excluded.value, count = excluded.count",
            )?;
            for (endpoint, status, count) in counts {
                let labels = json!({ "endpoint": endpoint, "status": status }).to_string();
                upsert.execute(params![
                    window_ts,
                    interval,
                    "requests_total",
                    labels,
                    count as f64,
                    count,
                ])?;
            }
            for (endpoint, avg_ms, count) in durations {
                let labels = json!({ "endpoint": endpoint }).to_string();
                upsert.execute(params![
                    window_ts,
                    interval,
                    "request_duration_ms",
                    labels,
                    avg_ms,
                    count,
                ])?;
            }
            Ok(())
        })
    }

    /// Runs cleanup when the configured number of hours elapsed.
    pub fn maybe_cleanup(&self) -> Result<bool, StoreError> {
        let hours = i64::from(self.settings.get().monitoring.cleanup_interval_hours.max(1));
        let now = Utc::now().timestamp();
        {
            let mut last = self.last_cleanup.lock().expect("metrics lock poisoned");
            if now - *last < hours * 3600 {
                return Ok(false);
            }
            *last = now;
        }
        self.perform_cleanup()?;
        Ok(true)
    }

    /// Applies the retention policy across the telemetry tables.
    pub fn perform_cleanup(&self) -> Result<(), StoreError> {
        let settings = self.settings.get();
        let now = Utc::now();
        let log_cutoff = now - Duration::days(i64::from(settings.metrics.retention_days));
        let rollup_cutoff =
            now - Duration::days(i64::from(settings.metrics.rollup_retention_days));
        let ws_cutoff = (now - Duration::hours(WS_HISTORY_RETENTION_HOURS))
            .format("%Y-%m-%dT%H:%M")
            .to_string();
        let feed_cutoff = now - Duration::days(FEED_EVENT_RETENTION_DAYS);

        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM request_logs WHERE ts < ?1",
                params![log_cutoff.to_rfc3339()],
            )?;
            conn.execute(
                "DELETE FROM metrics_rollup WHERE ts < ?1",
                params![rollup_cutoff.to_rfc3339()],
            )?;
            conn.execute(
                "DELETE FROM ws_client_history WHERE ts < ?1",
                params![ws_cutoff],
            )?;
            conn.execute(
                "DELETE FROM feed_events WHERE ts < ?1",
                params![feed_cutoff.to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Prometheus text exposition with the stable `canaria_*` names.
    pub fn render_prometheus(&self, ctx: &ExportContext) -> Result<String, StoreError> {
        let mut out = String::new();

        let _ = writeln!(out, "# TYPE canaria_events_total counter");
        for (source, count) in &ctx.events_by_source {
            let _ = writeln!(out, "canaria_events_total{{source=\"{source}\"}} {count}");
        }

        let _ = writeln!(out, "# TYPE canaria_websocket_clients gauge");
        let _ = writeln!(out, "canaria_websocket_clients {}", ctx.ws_clients);

        if let Some(age) = ctx.heartbeat_age_secs {
            let _ = writeln!(out, "# TYPE canaria_parser_heartbeat_age_seconds gauge");
            let _ = writeln!(out, "canaria_parser_heartbeat_age_seconds {age:.3}");
        }

        let _ = writeln!(out, "# TYPE canaria_feed_connected gauge");
        for (feed, connected) in &ctx.feeds {
            let _ = writeln!(
                out,
                "canaria_feed_connected{{feed=\"{feed}\"}} {}",
                i32::from(*connected)
            );
        }

        let (counts, durations) = self.request_aggregates()?;
        let _ = writeln!(out, "# TYPE canaria_requests_total counter");
        for (endpoint, status, count) in &counts {
            let _ = writeln!(
                out,
                "canaria_requests_total{{endpoint=\"{endpoint}\",status=\"{status}\"}} {count}"
            );
        }
        let _ = writeln!(out, "# TYPE canaria_request_duration_seconds gauge");
        for (endpoint, avg_ms) in &durations {
            let _ = writeln!(
                out,
                "canaria_request_duration_seconds{{endpoint=\"{endpoint}\"}} {:.6}",
                avg_ms / 1000.0
            );
        }

        Ok(out)
    }

    /// JSON export: the Prometheus data plus sliding 5-minute latency
    /// percentiles and requests-per-minute.
    pub fn render_json(&self, ctx: &ExportContext) -> Result<Value, StoreError> {
        let (counts, durations) = self.request_aggregates()?;
        let latency = self.sliding_latency()?;

        Ok(json!({
            "eventsTotal": ctx.events_by_source.iter()
                .map(|(s, c)| json!({ "source": s, "count": c }))
                .collect::<Vec<_>>(),
            "websocketClients": ctx.ws_clients,
            "parserHeartbeatAgeSeconds": ctx.heartbeat_age_secs,
            "feeds": ctx.feeds.iter()
                .map(|(f, up)| json!({ "feed": f, "connected": up }))
                .collect::<Vec<_>>(),
            "requestsTotal": counts.iter()
                .map(|(e, s, c)| json!({ "endpoint": e, "status": s, "count": c }))
                .collect::<Vec<_>>(),
            "requestDurationMs": durations.iter()
                .map(|(e, avg)| json!({ "endpoint": e, "avgMs": avg }))
                .collect::<Vec<_>>(),
            "latency": latency,
        }))
    }

    fn request_aggregates(
        &self,
    ) -> Result<(Vec<(String, i64, i64)>, Vec<(String, f64)>), StoreError> {
        self.store.with_conn(|conn| {
            let mut by_status = conn.prepare(
                "SELECT endpoint, status, COUNT(*) FROM request_logs
                 GROUP BY endpoint, status ORDER BY endpoint, status",
            )?;
            let counts = by_status
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut by_endpoint = conn.prepare(
                "SELECT endpoint, AVG(duration_ms) FROM request_logs
                 GROUP BY endpoint ORDER BY endpoint",
            )?;
            let durations = by_endpoint
                .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok((counts, durations))
        })
    }

    /// Nearest-rank p50/p95/p99 and per-minute rate over the trailing window.
    fn sliding_latency(&self) -> Result<Value, StoreError> {
        let cutoff = (Utc::now() - Duration::seconds(PERCENTILE_WINDOW_SECS)).to_rfc3339();
        let mut samples: Vec<f64> = self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT duration_ms FROM request_logs WHERE ts >= ?1 ORDER BY duration_ms",
            )?;
            let result = stmt
                .query_map(params![cutoff], |r| r.get(0))?
                .collect::<rusqlite::Result<_>>();
            result
        })?;
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let rate_per_minute =
            samples.len() as f64 / (PERCENTILE_WINDOW_SECS as f64 / 60.0);
        Ok(json!({
            "windowSeconds": PERCENTILE_WINDOW_SECS,
            "samples": samples.len(),
            "ratePerMinute": rate_per_minute,
            "p50Ms": nearest_rank(&samples, 50.0),
            "p95Ms": nearest_rank(&samples, 95.0),
            "p99Ms": nearest_rank(&samples, 99.0),
        }))
    }
}

/// Nearest-rank percentile over an ascending-sorted slice.
fn nearest_rank(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = ((percentile / 100.0) * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn metrics() -> (Metrics, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let settings = Arc::new(SettingsManager::new(store.clone()).unwrap());
        settings
            .update(&json!({ "metrics": { "rollupInterval": "5m" } }))
            .unwrap();
        (Metrics::new(store.clone(), settings), store)
    }

    fn log_at(metrics: &Metrics, ts: DateTime<Utc>, endpoint: &str, status: u16, ms: f64) {
        metrics
            .log_request(&RequestLog {
                ts,
                endpoint: endpoint.into(),
                method: "GET".into(),
                status,
                duration_ms: ms,
                ip: "1.2.3.4".into(),
                user_agent: None,
            })
            .unwrap();
    }

    fn rollup_rows(store: &Store) -> Vec<(String, String, f64, i64)> {
        store
            .with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT metric_name, labels, value, count FROM metrics_rollup
                     ORDER BY metric_name, labels",
                )?;
                let rows = stmt.query_map([], |r| {
                    Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                })?;
                rows.collect()
            })
            .unwrap()
    }

    #[test]
    fn rollup_is_idempotent() {
        let (metrics, store) = metrics();
        // Window under test: [12:00, 12:05). Rollup runs "now" at 12:06.
        let base = Utc.with_ymd_and_hms(2024, 3, 11, 12, 1, 0).unwrap();
        for i in 0..7 {
            let status = if i < 5 { 200 } else { 500 };
            log_at(&metrics, base + Duration::seconds(i * 10), "GET /v1/events", status, 4.0);
        }
        let now = Utc.with_ymd_and_hms(2024, 3, 11, 12, 6, 0).unwrap();

        metrics.perform_rollup_at(now).unwrap();
        let first = rollup_rows(&store);
        metrics.perform_rollup_at(now).unwrap();
        let second = rollup_rows(&store);
        assert_eq!(first, second);

        let requests: Vec<_> = first
            .iter()
            .filter(|(name, ..)| name == "requests_total")
            .collect();
        assert_eq!(requests.len(), 2);
        let total: f64 = requests.iter().map(|(.., v, _)| v).sum();
        assert_eq!(total, 7.0);

        let duration = first
            .iter()
            .find(|(name, ..)| name == "request_duration_ms")
            .unwrap();
        assert_eq!(duration.2, 4.0);
        assert_eq!(duration.3, 7);
    }

    #[test]
    fn rollup_ignores_the_open_window() {
        let (metrics, store) = metrics();
        let now = Utc.with_ymd_and_hms(2024, 3, 11, 12, 6, 0).unwrap();
        // Inside the still-open [12:05, 12:10) window.
        log_at(&metrics, now - Duration::seconds(30), "GET /v1/events", 200, 1.0);
        metrics.perform_rollup_at(now).unwrap();
        assert!(rollup_rows(&store).is_empty());
    }

    #[test]
    fn ws_client_count_is_last_writer_wins() {
        let (metrics, _store) = metrics();
        metrics.record_ws_client_count(3).unwrap();
        metrics.record_ws_client_count(5).unwrap();
        let history = metrics.ws_history(60).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].1, 5);
    }

    #[test]
    fn cleanup_applies_retention() {
        let (metrics, store) = metrics();
        let old = Utc::now() - Duration::days(10);
        log_at(&metrics, old, "GET /v1/events", 200, 1.0);
        log_at(&metrics, Utc::now(), "GET /v1/events", 200, 1.0);
        metrics.record_feed_event("wolfx", "connected", None).unwrap();
        store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO feed_events (ts, feed, event) VALUES (?1, 'p2p', 'connected')",
                    params![(Utc::now() - Duration::days(8)).to_rfc3339()],
                )?;
                Ok(())
            })
            .unwrap();

        metrics.perform_cleanup().unwrap();

        let logs: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM request_logs", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(logs, 1);
        let feeds: i64 = store
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM feed_events", [], |r| r.get(0)))
            .unwrap();
        assert_eq!(feeds, 1);
    }

    #[test]
    fn nearest_rank_percentiles() {
        let samples: Vec<f64> = (1..=100).map(f64::from).collect();
        assert_eq!(nearest_rank(&samples, 50.0), Some(50.0));
        assert_eq!(nearest_rank(&samples, 95.0), Some(95.0));
        assert_eq!(nearest_rank(&samples, 99.0), Some(99.0));
        assert_eq!(nearest_rank(&[], 50.0), None);
        assert_eq!(nearest_rank(&[7.0], 99.0), Some(7.0));
    }

    #[test]
    fn prometheus_export_has_stable_names() {
        let (metrics, _store) = metrics();
        log_at(&metrics, Utc::now(), "GET /v1/events", 200, 5.0);
        let ctx = ExportContext {
            events_by_source: vec![("JMA".into(), 12)],
            ws_clients: 3,
            heartbeat_age_secs: Some(4.2),
            feeds: vec![("wolfx".into(), true), ("p2p".into(), false)],
        };
        let text = metrics.render_prometheus(&ctx).unwrap();
        assert!(text.contains("canaria_events_total{source=\"JMA\"} 12"));
        assert!(text.contains("canaria_websocket_clients 3"));
        assert!(text.contains("canaria_parser_heartbeat_age_seconds 4.200"));
        assert!(text.contains("canaria_feed_connected{feed=\"wolfx\"} 1"));
        assert!(text.contains("canaria_feed_connected{feed=\"p2p\"} 0"));
        assert!(text.contains("canaria_requests_total{endpoint=\"GET /v1/events\",status=\"200\"} 1"));
        assert!(text.contains("canaria_request_duration_seconds{endpoint=\"GET /v1/events\"} 0.005000"));
    }

    #[test]
    fn json_export_includes_percentiles() {
        let (metrics, _store) = metrics();
        for ms in [1.0, 2.0, 3.0, 4.0] {
            log_at(&metrics, Utc::now(), "GET /v1/events", 200, ms);
        }
        let value = metrics.render_json(&ExportContext::default()).unwrap();
        assert_eq!(value["latency"]["samples"], 4);
        assert_eq!(value["latency"]["p50Ms"], 2.0);
        assert_eq!(value["latency"]["p99Ms"], 4.0);
    }
}
