//! Operator-facing read models and actions.
//!
//! Everything here is a synchronous projection over component snapshots: the
//! health classifier, the enhanced status and monitoring views, the dashboard
//! aggregate, and the dispatch table for `POST /admin/actions`.

use chrono::Utc;
use serde_json::{json, Value};

use crate::feeds::FeedStatus;
use crate::http::AppState;
use crate::store::StoreError;

/// Tri-state health classification per subsystem plus the overall verdict.
#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub body: Value,
}

/// Parser healthy iff the heartbeat is fresh; feeds healthy iff at least one
/// connector is connected; database healthy iff a count query succeeds.
pub fn health(state: &AppState) -> HealthReport {
    let settings = state.settings.get();
    let parser_timeout = f64::from(settings.monitoring.parser_timeout_seconds);

    let heartbeat_age = state.ingest.heartbeat_age_secs();
    let parser_healthy = heartbeat_age.map(|age| age < parser_timeout).unwrap_or(false);

    let feeds_healthy = state.feeds.any_connected();

    let database_healthy = state.store.count().is_ok();

    let healthy = parser_healthy && feeds_healthy && database_healthy;
    let body = json!({
        "healthy": healthy,
        "timestamp": Utc::now(),
        "checks": {
            "parser": {
                "healthy": parser_healthy,
                "heartbeatAgeSeconds": heartbeat_age,
                "timeoutSeconds": settings.monitoring.parser_timeout_seconds,
            },
            "feeds": {
                "healthy": feeds_healthy,
                "connected": state.feeds.snapshots().iter()
                    .filter(|(_, s)| s.status == FeedStatus::Connected)
                    .map(|(name, _)| *name)
                    .collect::<Vec<_>>(),
            },
            "database": { "healthy": database_healthy },
        },
    });
    HealthReport { healthy, body }
}

/// One-line summary for `/v1/status`.
pub fn status_summary(state: &AppState) -> Value {
    let report = health(state);
    let status = if report.healthy { "ok" } else { "degraded" };
    let connected = state
        .feeds
        .snapshots()
        .iter()
        .filter(|(_, s)| s.status == FeedStatus::Connected)
        .count();
    json!({
        "status": status,
        "summary": format!(
            "{} of {} feeds connected, {} events stored, {} subscribers",
            connected,
            state.feeds.snapshots().len(),
            state.store.count().unwrap_or(0),
            state.hub.size(),
        ),
        "timestamp": Utc::now(),
    })
}

/// Per-source and per-feed detail for `/v1/connections`.
pub fn enhanced_status(state: &AppState) -> Value {
    let now = Utc::now();
    let feed_timeout = i64::from(state.settings.get().monitoring.feed_timeout_seconds);
    let mut feeds = serde_json::Map::new();
    for (name, snapshot) in state.feeds.snapshots() {
        // Connected but silent past the feed timeout is reported as stale.
        let stale = snapshot.status == FeedStatus::Connected
            && snapshot
                .last_message_at
                .map(|at| (now - at).num_seconds() > feed_timeout)
                .unwrap_or(false);
        feeds.insert(
            name.to_string(),
            json!({
                "status": snapshot.status,
                "stale": stale,
                "lastMessageAt": snapshot.last_message_at,
                "lastHeartbeatAt": snapshot.last_heartbeat_at,
                "lastError": snapshot.last_error,
                "connectedAt": snapshot.connected_at,
                "disconnectedAt": snapshot.disconnected_at,
                "reconnectCount": snapshot.reconnect_count,
                "sessionUptimeMs": snapshot.session_uptime_ms(now),
                "totalUptimeMs": snapshot.uptime_ms(now),
                "uptimePercent": snapshot.uptime_percent(state.started_at, now),
            }),
        );
    }

    let sources: Vec<Value> = state
        .store
        .source_counts()
        .unwrap_or_default()
        .into_iter()
        .map(|(source, count)| json!({ "source": source, "events": count }))
        .collect();

    json!({
        "timestamp": now,
        "startedAt": state.started_at,
        "websocket": {
            "active": state.hub.size(),
            "total": state.hub.total_connection_count(),
        },
        "sources": sources,
        "feeds": Value::Object(feeds),
        "parser": state.ingest.heartbeat_snapshot(),
        "lastStoredAt": state.ingest.last_stored_at(),
    })
}

/// Detailed monitoring snapshot for `/v1/monitoring`.
pub fn monitoring(state: &AppState) -> Value {
    let now = Utc::now();
    let heartbeat = state.ingest.heartbeat_snapshot();
    let parser = match &heartbeat {
        Some(snapshot) => json!({
            "authorityReachable": snapshot.heartbeat.authority_reachable,
            "heartbeatAgeSeconds": state.ingest.heartbeat_age_secs(),
            "successRate": snapshot.heartbeat.success_rate,
            "averageDelayMs": snapshot.heartbeat.delay_ms,
            "lastParseTime": snapshot.heartbeat.last_parse_time,
            "lastEventTime": snapshot.heartbeat.last_event_time,
            "stats": snapshot.heartbeat.stats,
        }),
        None => json!({
            "authorityReachable": false,
            "heartbeatAgeSeconds": null,
            "successRate": null,
        }),
    };

    let mut status = enhanced_status(state);
    status["parserMetrics"] = parser;
    status["uptime"] = json!(format_uptime((now - state.started_at).num_seconds().max(0)));
    status["recentParserErrors"] = json!(state.ingest.parser_errors(5));
    status
}

/// Aggregated operator dashboard for `/admin/dashboard`.
pub fn dashboard(state: &AppState) -> Result<Value, StoreError> {
    let now = Utc::now();
    let five_min_count = state.store.count_since(now - chrono::Duration::minutes(5))?;

    Ok(json!({
        "timestamp": now,
        "events": {
            "total": state.store.count()?,
            "bySource": state.store.source_counts()?.into_iter()
                .map(|(s, c)| json!({ "source": s, "count": c }))
                .collect::<Vec<_>>(),
            "ratePerMinute5m": five_min_count as f64 / 5.0,
            "oldest": state.store.oldest()?.map(|e| e.time),
            "latest": state.store.latest()?.map(|e| e.time),
        },
        "websocketHistory": state.metrics.ws_history(60)?.into_iter()
            .map(|(ts, count)| json!({ "ts": ts, "count": count }))
            .collect::<Vec<_>>(),
        "rateLimit": {
            "topIps": state.ratelimit.top_ips(10)?,
            "total429": state.metrics.count_429()?,
        },
        "tables": state.store.table_stats()?,
        "config": state.settings.get(),
    }))
}

/// Outcome of one admin action.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ActionResult {
    fn ok(message: impl Into<String>, result: Option<Value>) -> Self {
        Self { success: true, message: message.into(), result }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { success: false, message: message.into(), result: None }
    }
}

/// Dispatches a named operator action with optional parameters.
pub fn execute_action(state: &AppState, action: &str, params: &Value) -> ActionResult {
    match action {
        "reconnect_feed" => {
            let Some(feed) = params.get("feed").and_then(Value::as_str) else {
                return ActionResult::failed("missing parameter: feed");
            };
            if state.feeds.reconnect(feed) {
                ActionResult::ok(format!("reconnect forced for feed {feed}"), None)
            } else {
                ActionResult::failed(format!("unknown feed: {feed}"))
            }
        }
        "clear_old_events" => {
            let days = params
                .get("daysOld")
                .and_then(Value::as_u64)
                .map(|d| d as u32)
                .unwrap_or(30);
            match state.store.delete_older_than(days) {
                Ok(deleted) => ActionResult::ok(
                    format!("deleted events older than {days} days"),
                    Some(json!({ "deleted": deleted })),
                ),
                Err(e) => ActionResult::failed(format!("delete failed: {e}")),
            }
        }
        "reset_ratelimit" => {
            let Some(ip) = params.get("ip").and_then(Value::as_str) else {
                return ActionResult::failed("missing parameter: ip");
            };
            let endpoint = params.get("endpoint").and_then(Value::as_str);
            match state.ratelimit.reset(ip, endpoint) {
                Ok(removed) => ActionResult::ok(
                    format!("rate limits reset for {ip}"),
                    Some(json!({ "removed": removed })),
                ),
                Err(e) => ActionResult::failed(format!("reset failed: {e}")),
            }
        }
        "trigger_rollup" => match state.metrics.perform_rollup() {
            Ok(()) => ActionResult::ok("rollup complete", None),
            Err(e) => ActionResult::failed(format!("rollup failed: {e}")),
        },
        "cleanup_now" => {
            let metrics = state.metrics.perform_cleanup();
            let limiter = state.ratelimit.cleanup();
            match (metrics, limiter) {
                (Ok(()), Ok(removed)) => ActionResult::ok(
                    "cleanup complete",
                    Some(json!({ "rateLimitRowsRemoved": removed })),
                ),
                (Err(e), _) | (_, Err(e)) => {
                    ActionResult::failed(format!("cleanup failed: {e}"))
                }
            }
        }
        other => ActionResult::failed(format!("unknown action: {other}")),
    }
}

/// `86461 → "1d 0h 1m"`.
fn format_uptime(total_secs: i64) -> String {
    let days = total_secs / 86_400;
    let hours = (total_secs % 86_400) / 3_600;
    let minutes = (total_secs % 3_600) / 60;
    if days > 0 {
        format!("{days}d {hours}h {minutes}m")
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}
