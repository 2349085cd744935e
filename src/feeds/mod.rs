//! Long-lived upstream feed connectors.
//!
//! Each configured upstream gets one connector task owning a WebSocket
//! session and its timers. A connector cycles `Connecting → Connected →
//! Disconnected → Connecting …` with capped exponential backoff, keepalive
//! pings, and an inactivity watchdog that force-closes zombie sockets where
//! the TCP session is open but no data flows. Normalized events leave the
//! connector over a typed channel of batches; the connector never touches
//! the store directly.

pub mod p2p;
pub mod wolfx;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::metrics::Metrics;
use crate::model::Event;

/// Initial reconnect delay.
const BASE_BACKOFF: Duration = Duration::from_secs(2);
/// Reconnect delay ceiling.
const MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Keepalive ping cadence on an open upstream socket.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// A session without any inbound traffic for this long is force-closed.
const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);
/// Watchdog granularity.
const WATCHDOG_TICK: Duration = Duration::from_secs(5);
/// Most-recent records fetched over HTTP on startup.
const HISTORY_LIMIT: usize = 100;
/// Deadline for the startup history fetch.
const HISTORY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedStatus {
    Connecting,
    Connected,
    Disconnected,
}

/// Connector liveness state. Written only by the owning task; everyone else
/// sees snapshot clones.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedState {
    pub status: FeedStatus,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub reconnect_count: u32,
    pub total_uptime_ms: u64,
}

impl FeedState {
    fn new() -> Self {
        Self {
            status: FeedStatus::Connecting,
            last_message_at: None,
            last_heartbeat_at: None,
            last_error: None,
            connected_at: None,
            disconnected_at: None,
            reconnect_count: 0,
            total_uptime_ms: 0,
        }
    }

    fn on_connecting(&mut self) {
        self.status = FeedStatus::Connecting;
    }

    fn on_connected(&mut self, now: DateTime<Utc>) {
        if self.disconnected_at.is_some() {
            self.reconnect_count += 1;
        }
        self.status = FeedStatus::Connected;
        self.connected_at = Some(now);
        self.last_error = None;
    }

    fn on_message(&mut self, now: DateTime<Utc>) {
        self.last_message_at = Some(now);
        self.last_heartbeat_at = Some(now);
        self.last_error = None;
    }

    fn on_heartbeat(&mut self, now: DateTime<Utc>) {
        self.last_heartbeat_at = Some(now);
    }

    fn on_disconnected(&mut self, now: DateTime<Utc>, error: Option<String>) {
        if self.status == FeedStatus::Connected {
            if let Some(connected) = self.connected_at {
                let session_ms = (now - connected).num_milliseconds().max(0) as u64;
                self.total_uptime_ms += session_ms;
            }
        }
        self.status = FeedStatus::Disconnected;
        self.disconnected_at = Some(now);
        self.last_error = error;
    }

    /// Milliseconds of the currently open session, zero when disconnected.
    pub fn session_uptime_ms(&self, now: DateTime<Utc>) -> u64 {
        match (self.status, self.connected_at) {
            (FeedStatus::Connected, Some(connected)) => {
                (now - connected).num_milliseconds().max(0) as u64
            }
            _ => 0,
        }
    }

    /// Accumulated uptime including the open session.
    pub fn uptime_ms(&self, now: DateTime<Utc>) -> u64 {
        self.total_uptime_ms + self.session_uptime_ms(now)
    }

    /// Uptime as a percentage of wall time since `started_at`.
    pub fn uptime_percent(&self, started_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
        let elapsed_ms = (now - started_at).num_milliseconds().max(1) as f64;
        (self.uptime_ms(now) as f64 / elapsed_ms * 100.0).min(100.0)
    }
}

/// What a normalizer made of one upstream frame.
#[derive(Debug)]
pub enum FrameOutcome {
    /// Canonical events to ingest. Malformed records inside the frame were
    /// already dropped individually.
    Events(Vec<Event>),
    /// Protocol-level liveness frame; answer with a pong, emit nothing.
    Heartbeat,
    /// Frame is valid but outside our interest (or malformed entirely).
    Ignored,
}

pub type Normalizer = fn(&str) -> FrameOutcome;

/// Static description of one upstream feed.
#[derive(Clone)]
pub struct FeedSpec {
    pub name: &'static str,
    pub ws_url: String,
    pub history_url: Option<String>,
    pub normalizer: Normalizer,
}

/// The standard connector set: the JMA EEW relay and the P2P relay.
pub fn standard_feeds(config: &Config) -> Vec<FeedSpec> {
    vec![
        FeedSpec {
            name: "wolfx",
            ws_url: config.wolfx_ws_url.clone(),
            history_url: Some(config.wolfx_history_url.clone()),
            normalizer: wolfx::normalize,
        },
        FeedSpec {
            name: "p2p",
            ws_url: config.p2p_ws_url.clone(),
            history_url: Some(config.p2p_history_url.clone()),
            normalizer: p2p::normalize,
        },
    ]
}

/// Capped exponential reconnect delay: 2, 4, 8, … capped at 60 seconds.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self { current: BASE_BACKOFF }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = BASE_BACKOFF;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared view of one running connector.
pub struct FeedHandle {
    pub name: &'static str,
    state: Mutex<FeedState>,
    session: Mutex<CancellationToken>,
}

impl FeedHandle {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(FeedState::new()),
            session: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn snapshot(&self) -> FeedState {
        self.state.lock().expect("feed state lock poisoned").clone()
    }

    fn update(&self, f: impl FnOnce(&mut FeedState)) {
        let mut state = self.state.lock().expect("feed state lock poisoned");
        f(&mut state);
    }

    /// Force-closes the active session (or skips the pending backoff). The
    /// connector reconnects immediately.
    pub fn force_reconnect(&self) {
        self.session.lock().expect("feed session lock poisoned").cancel();
    }

    fn fresh_session(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.session.lock().expect("feed session lock poisoned") = token.clone();
        token
    }
}

/// Owns the spawned connector tasks and their shared handles.
pub struct FeedManager {
    feeds: Vec<Arc<FeedHandle>>,
}

impl FeedManager {
    /// Spawns one connector task per spec.
    pub fn spawn(
        specs: Vec<FeedSpec>,
        events_tx: mpsc::UnboundedSender<Vec<Event>>,
        metrics: Arc<Metrics>,
        shutdown: &broadcast::Sender<()>,
    ) -> Self {
        let mut feeds = Vec::with_capacity(specs.len());
        for spec in specs {
            let handle = Arc::new(FeedHandle::new(spec.name));
            feeds.push(handle.clone());
            tokio::spawn(run_connector(
                spec,
                handle,
                events_tx.clone(),
                metrics.clone(),
                shutdown.subscribe(),
            ));
        }
        Self { feeds }
    }

    /// Manager with no live connectors; used when feeds are disabled.
    pub fn empty() -> Self {
        Self { feeds: Vec::new() }
    }

    pub fn snapshots(&self) -> Vec<(&'static str, FeedState)> {
        self.feeds.iter().map(|f| (f.name, f.snapshot())).collect()
    }

    pub fn any_connected(&self) -> bool {
        self.feeds
            .iter()
            .any(|f| f.snapshot().status == FeedStatus::Connected)
    }

    pub fn reconnect(&self, name: &str) -> bool {
        match self.feeds.iter().find(|f| f.name == name) {
            Some(feed) => {
                feed.force_reconnect();
                true
            }
            None => false,
        }
    }
}

fn record_feed_event(metrics: &Metrics, feed: &str, event: &str, details: Option<&str>) {
    if let Err(e) = metrics.record_feed_event(feed, event, details) {
        log::warn!("failed to record feed event for {feed}: {e}");
    }
}

/// Connector task: history backfill once, then the reconnect loop.
async fn run_connector(
    spec: FeedSpec,
    handle: Arc<FeedHandle>,
    events_tx: mpsc::UnboundedSender<Vec<Event>>,
    metrics: Arc<Metrics>,
    mut shutdown: broadcast::Receiver<()>,
) {
    if let Some(url) = &spec.history_url {
        match backfill_history(&spec, url, &events_tx).await {
            Ok(count) => log::info!("{}: backfilled {count} historical events", spec.name),
            Err(e) => log::warn!("{}: history backfill failed: {e}", spec.name),
        }
    }

    let mut backoff = Backoff::new();
    loop {
        handle.update(|s| s.on_connecting());
        log::info!("{}: connecting to {}", spec.name, spec.ws_url);

        let connect = connect_async(&spec.ws_url);
        let stream = tokio::select! {
            _ = shutdown.recv() => return,
            result = connect => result,
        };

        match stream {
            Ok((ws, _response)) => {
                handle.update(|s| s.on_connected(Utc::now()));
                backoff.reset();
                record_feed_event(&metrics, spec.name, "connected", None);
                log::info!("{}: connected", spec.name);

                let reason =
                    run_session(&spec, &handle, ws, &events_tx, &mut shutdown).await;

                let reason = match reason {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Closed(reason) => reason,
                };
                handle.update(|s| s.on_disconnected(Utc::now(), Some(reason.clone())));
                record_feed_event(&metrics, spec.name, "disconnected", Some(&reason));
                log::warn!("{}: disconnected: {reason}", spec.name);
            }
            Err(e) => {
                let reason = format!("connect failed: {e}");
                handle.update(|s| s.on_disconnected(Utc::now(), Some(reason.clone())));
                record_feed_event(&metrics, spec.name, "connect_failed", Some(&reason));
                log::error!("{}: {reason}", spec.name);
            }
        }

        // Backoff before the next attempt; a forced reconnect skips it.
        let delay = backoff.next();
        let waker = handle.fresh_session();
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = waker.cancelled() => {
                log::info!("{}: reconnect forced, skipping backoff", spec.name);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

enum SessionEnd {
    /// Process shutdown; do not reconnect.
    Shutdown,
    /// Session ended for the given reason; reconnect after backoff.
    Closed(String),
}

async fn run_session(
    spec: &FeedSpec,
    handle: &FeedHandle,
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    events_tx: &mpsc::UnboundedSender<Vec<Event>>,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let (mut write, mut read) = ws.split();
    let session = handle.fresh_session();

    let mut ping = tokio::time::interval(PING_INTERVAL);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ping.tick().await; // immediate first tick

    let mut watchdog = tokio::time::interval(WATCHDOG_TICK);
    watchdog.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = write.close().await;
                return SessionEnd::Shutdown;
            }
            _ = session.cancelled() => {
                let _ = write.close().await;
                return SessionEnd::Closed("reconnect requested".to_string());
            }
            _ = ping.tick() => {
                if write.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                    return SessionEnd::Closed("keepalive ping failed".to_string());
                }
            }
            _ = watchdog.tick() => {
                if last_activity.elapsed() > INACTIVITY_TIMEOUT {
                    let _ = write.close().await;
                    return SessionEnd::Closed(format!(
                        "no traffic for {}s", INACTIVITY_TIMEOUT.as_secs()
                    ));
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_activity = Instant::now();
                        handle.update(|s| s.on_message(Utc::now()));
                        match (spec.normalizer)(&text) {
                            FrameOutcome::Events(events) => {
                                if !events.is_empty() && events_tx.send(events).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            FrameOutcome::Heartbeat => {
                                handle.update(|s| s.on_heartbeat(Utc::now()));
                                let _ = write.send(WsMessage::Pong(Vec::new().into())).await;
                            }
                            FrameOutcome::Ignored => {}
                        }
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        last_activity = Instant::now();
                        handle.update(|s| s.on_heartbeat(Utc::now()));
                        let _ = write.send(WsMessage::Pong(data)).await;
                    }
                    Some(Ok(WsMessage::Pong(_))) => {
                        last_activity = Instant::now();
                        handle.update(|s| s.on_heartbeat(Utc::now()));
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        return SessionEnd::Closed("closed by remote".to_string());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return SessionEnd::Closed(format!("socket error: {e}"));
                    }
                }
            }
        }
    }
}

/// Fetches the bounded most-recent history window over HTTP and emits the
/// normalized events oldest-first so subscribers get a coherent backlog.
async fn backfill_history(
    spec: &FeedSpec,
    url: &str,
    events_tx: &mpsc::UnboundedSender<Vec<Event>>,
) -> anyhow::Result<usize> {
    let client = crate::backup::retry_client();
    let response = client
        .get(url)
        .timeout(HISTORY_TIMEOUT)
        .send()
        .await?
        .error_for_status()?;
    let records: Vec<serde_json::Value> = response.json().await?;

    let mut events: Vec<Event> = Vec::new();
    for record in records.iter().take(HISTORY_LIMIT) {
        if let FrameOutcome::Events(mut batch) = (spec.normalizer)(&record.to_string()) {
            events.append(&mut batch);
        }
    }
    events.sort_by_key(|e| e.time);

    let count = events.len();
    if count > 0 {
        let _ = events_tx.send(events);
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn backoff_sequence_is_capped() {
        let mut backoff = Backoff::new();
        let seq: Vec<u64> = (0..7).map(|_| backoff.next().as_secs()).collect();
        assert_eq!(seq, [2, 4, 8, 16, 32, 60, 60]);
        backoff.reset();
        assert_eq!(backoff.next().as_secs(), 2);
    }

    #[test]
    fn flap_accounting() {
        let mut state = FeedState::new();
        let t0 = Utc::now();

        // open → 10 s traffic → close
        state.on_connected(t0);
        assert_eq!(state.reconnect_count, 0);
        state.on_message(t0 + ChronoDuration::seconds(5));
        state.on_disconnected(t0 + ChronoDuration::seconds(10), Some("closed".into()));
        assert_eq!(state.status, FeedStatus::Disconnected);
        assert_eq!(state.total_uptime_ms, 10_000);

        // 2 s gap → open → 5 s traffic
        let t1 = t0 + ChronoDuration::seconds(12);
        state.on_connected(t1);
        assert_eq!(state.reconnect_count, 1);
        assert_eq!(state.status, FeedStatus::Connected);

        let now = t1 + ChronoDuration::seconds(5);
        assert_eq!(state.session_uptime_ms(now), 5_000);
        assert_eq!(state.uptime_ms(now), 15_000);
        assert!(state.last_error.is_none());
    }

    #[test]
    fn failed_connect_does_not_accrue_uptime() {
        let mut state = FeedState::new();
        let t0 = Utc::now();
        state.on_connecting();
        state.on_disconnected(t0, Some("connect failed".into()));
        assert_eq!(state.total_uptime_ms, 0);
        assert_eq!(state.reconnect_count, 0);

        // The first successful connect after a failure counts as a reconnect,
        // since a disconnect was recorded.
        state.on_connected(t0 + ChronoDuration::seconds(2));
        assert_eq!(state.reconnect_count, 1);
    }

    #[test]
    fn uptime_percent_is_bounded() {
        let mut state = FeedState::new();
        let start = Utc::now();
        state.on_connected(start);
        let now = start + ChronoDuration::seconds(100);
        let pct = state.uptime_percent(start, now);
        assert!((99.0..=100.0).contains(&pct), "pct = {pct}");
    }

    #[test]
    fn force_reconnect_cancels_current_session() {
        let handle = FeedHandle::new("wolfx");
        let token = handle.fresh_session();
        assert!(!token.is_cancelled());
        handle.force_reconnect();
        assert!(token.is_cancelled());
        // A fresh session starts clean.
        assert!(!handle.fresh_session().is_cancelled());
    }
}
