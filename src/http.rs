//! HTTP surface: routes, auth, middleware and the subscriber WebSocket.
//!
//! Every request passes the tracking middleware: endpoint classification,
//! client IP derivation from trusted forwarding headers, rate limiter
//! consultation (429 + headers on denial) and completion logging. Periodic
//! maintenance (rollup, cleanup, minute client-count samples) runs on its own
//! background tick rather than the request path; the gating contract is the
//! same.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::admin;
use crate::config::Config;
use crate::feeds::{FeedManager, FeedStatus};
use crate::hub::ConnectionHub;
use crate::ingest::Ingest;
use crate::metrics::{ExportContext, Metrics, RequestLog};
use crate::model::{frames, normalize_timestamp, Source, SubmitBody};
use crate::ratelimit::{Decision, RateLimiter};
use crate::settings::{SettingsError, SettingsManager};
use crate::store::{EventQuery, Store, StoreError};

/// Background maintenance cadence. The rollup/cleanup gates keep their own
/// intervals; this only bounds how late they can fire.
const MAINTENANCE_TICK: Duration = Duration::from_secs(30);

/// Shared handles for every component the surface wires together.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub settings: Arc<SettingsManager>,
    pub ratelimit: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub hub: Arc<ConnectionHub>,
    pub feeds: Arc<FeedManager>,
    pub ingest: Arc<Ingest>,
    pub started_at: DateTime<Utc>,
}

/// Request-level failures mapped onto HTTP statuses.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Unauthorized,
    Store(StoreError),
    Settings(SettingsError),
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::Store(e)
    }
}

impl From<SettingsError> for ApiError {
    fn from(e: SettingsError) -> Self {
        ApiError::Settings(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::Store(e) => {
                log::error!("storage error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
            }
            ApiError::Settings(SettingsError::Invalid(message)) => {
                (StatusCode::BAD_REQUEST, message)
            }
            ApiError::Settings(e) => {
                log::error!("settings error: {e}");
                (StatusCode::INTERNAL_SERVER_ERROR, "settings error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/events", get(list_events).post(submit_events))
        .route("/v1/events/latest", get(latest_event))
        .route("/v1/status", get(status_view))
        .route("/v1/health", get(health_view))
        .route("/v1/connections", get(connections_view))
        .route("/v1/metrics", get(metrics_export))
        .route("/v1/monitoring", get(monitoring_view))
        .route("/v1/ws", get(ws_handler))
        .route("/admin/config", get(admin_config_get).put(admin_config_put))
        .route("/admin/dashboard", get(admin_dashboard))
        .route("/admin/actions", post(admin_actions))
        .layer(middleware::from_fn_with_state(state.clone(), track_requests))
        .with_state(state)
}

/// Serves on the configured port, with TLS when cert/key paths are present.
pub async fn serve(state: AppState, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    if let (Some(cert), Some(key)) =
        (state.config.tls_cert_path.clone(), state.config.tls_key_path.clone())
    {
        let app = build_router(state);
        log::info!("listening on https://{addr}");
        let tls = RustlsConfig::from_pem_file(cert, key).await?;
        axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
        Ok(())
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        serve_on(listener, state, shutdown).await
    }
}

/// Serves on an already-bound listener; the integration tests bind port 0
/// and pass the listener in.
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let app = build_router(state);
    log::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.recv().await.ok();
        log::info!("http server shutting down");
    })
    .await?;
    Ok(())
}

/// Background maintenance: rollup when due, cleanup when due, and one
/// client-count sample per minute.
pub fn spawn_maintenance(
    state: AppState,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut sampled_minute = String::new();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = ticker.tick() => {
                    if let Err(e) = state.metrics.maybe_rollup() {
                        log::warn!("rollup failed: {e}");
                    }
                    match state.metrics.maybe_cleanup() {
                        Ok(true) => {
                            if let Err(e) = state.ratelimit.cleanup() {
                                log::warn!("rate limit cleanup failed: {e}");
                            }
                        }
                        Ok(false) => {}
                        Err(e) => log::warn!("cleanup failed: {e}"),
                    }

                    let minute = Utc::now().format("%Y-%m-%dT%H:%M").to_string();
                    if minute != sampled_minute {
                        sampled_minute = minute;
                        if let Err(e) = state.metrics.record_ws_client_count(state.hub.size()) {
                            log::warn!("client count sample failed: {e}");
                        }
                    }
                }
            }
        }
    })
}

// --- middleware -----------------------------------------------------------

async fn track_requests(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = req.method().to_string();
    let endpoint = format!("{} {}", method, req.uri().path());
    let ip = client_ip(req.headers(), addr);
    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let decision = match state.ratelimit.check(&ip, &endpoint) {
        Ok(decision) => decision,
        Err(e) => {
            // A broken limiter must not take the API down.
            log::error!("rate limiter check failed: {e}");
            Decision { allowed: true, limit: 0, remaining: 0, reset_at: 0 }
        }
    };

    let mut response = if decision.allowed {
        next.run(req).await
    } else {
        let retry_after = decision.retry_after_secs(Utc::now().timestamp());
        (
            StatusCode::TOO_MANY_REQUESTS,
            [("retry-after", retry_after.to_string())],
            Json(json!({ "error": "rate limit exceeded" })),
        )
            .into_response()
    };
    apply_rate_headers(response.headers_mut(), &decision);

    let entry = RequestLog {
        ts: Utc::now(),
        endpoint,
        method,
        status: response.status().as_u16(),
        duration_ms: started.elapsed().as_secs_f64() * 1000.0,
        ip,
        user_agent,
    };
    if let Err(e) = state.metrics.log_request(&entry) {
        log::warn!("request log failed: {e}");
    }

    response
}

/// Client IP from trusted forwarding headers, falling back to the peer.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real = real.trim();
        if !real.is_empty() {
            return real.to_string();
        }
    }
    addr.ip().to_string()
}

fn apply_rate_headers(headers: &mut HeaderMap, decision: &Decision) {
    if decision.limit == 0 {
        return;
    }
    let pairs = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.to_string()),
    ];
    for (name, value) in pairs {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
}

// --- auth -----------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct AuthQuery {
    auth: Option<String>,
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

fn require_secret(
    headers: &HeaderMap,
    query_auth: Option<&str>,
    secret: &str,
) -> Result<(), ApiError> {
    let presented = bearer_token(headers).or(query_auth);
    match presented {
        Some(token) if token == secret => Ok(()),
        _ => Err(ApiError::Unauthorized),
    }
}

// --- v1 handlers ----------------------------------------------------------

async fn submit_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_secret(&headers, None, state.config.effective_ingest_secret())?;
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.to_string()))?;

    let outcome = state.ingest.submit(body)?;
    if outcome.sync {
        Ok((StatusCode::OK, Json(json!({ "sync": true }))).into_response())
    } else {
        Ok(StatusCode::NO_CONTENT.into_response())
    }
}

async fn latest_event(State(state): State<AppState>) -> Result<Response, ApiError> {
    match state.store.latest()? {
        Some(event) => Ok(Json(event).into_response()),
        None => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct EventsParams {
    since: Option<String>,
    until: Option<String>,
    source: Option<String>,
    r#type: Option<String>,
    limit: Option<usize>,
}

async fn list_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Response, ApiError> {
    fn parse_time(
        field: &str,
        raw: Option<&String>,
    ) -> Result<Option<DateTime<Utc>>, ApiError> {
        raw.map(|raw| {
            normalize_timestamp(raw)
                .ok_or_else(|| ApiError::BadRequest(format!("invalid {field}: {raw}")))
        })
        .transpose()
    }
    let source = params
        .source
        .as_deref()
        .map(|raw| {
            Source::parse(raw).ok_or_else(|| ApiError::BadRequest(format!("invalid source: {raw}")))
        })
        .transpose()?;

    let query = EventQuery {
        since: parse_time("since", params.since.as_ref())?,
        until: parse_time("until", params.until.as_ref())?,
        source,
        r#type: params.r#type,
        limit: params.limit,
    };
    let events = state.store.list(&query)?;
    Ok(Json(json!({ "events": events })).into_response())
}

async fn status_view(State(state): State<AppState>) -> Json<Value> {
    Json(admin::status_summary(&state))
}

async fn health_view(State(state): State<AppState>) -> Response {
    let report = admin::health(&state);
    let status = if report.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report.body)).into_response()
}

async fn connections_view(State(state): State<AppState>) -> Json<Value> {
    Json(admin::enhanced_status(&state))
}

async fn monitoring_view(State(state): State<AppState>) -> Json<Value> {
    Json(admin::monitoring(&state))
}

#[derive(Debug, Deserialize)]
struct MetricsParams {
    format: Option<String>,
}

fn export_context(state: &AppState) -> ExportContext {
    ExportContext {
        events_by_source: state.store.source_counts().unwrap_or_default(),
        ws_clients: state.hub.size(),
        heartbeat_age_secs: state.ingest.heartbeat_age_secs(),
        feeds: state
            .feeds
            .snapshots()
            .into_iter()
            .map(|(name, s)| (name.to_string(), s.status == FeedStatus::Connected))
            .collect(),
    }
}

async fn metrics_export(
    State(state): State<AppState>,
    Query(params): Query<MetricsParams>,
) -> Result<Response, ApiError> {
    let ctx = export_context(&state);
    match params.format.as_deref() {
        Some("json") => Ok(Json(state.metrics.render_json(&ctx)?).into_response()),
        _ => {
            let text = state.metrics.render_prometheus(&ctx)?;
            Ok((
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                text,
            )
                .into_response())
        }
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match upgrade {
        Ok(upgrade) => upgrade.on_upgrade(|socket| handle_socket(socket, state)),
        Err(_) => (
            StatusCode::UPGRADE_REQUIRED,
            Json(json!({ "error": "websocket upgrade required" })),
        )
            .into_response(),
    }
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    // Snapshot first: the most recent event, if any, is queued before the
    // subscriber becomes visible to broadcasts.
    let snapshot = state
        .store
        .latest()
        .ok()
        .flatten()
        .map(|event| frames::snapshot(&event));
    let (id, mut rx) = state.hub.register(snapshot);

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // Inbound frames are ignored; this is a one-way feed.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.hub.unregister(id);
}

// --- admin handlers -------------------------------------------------------

async fn admin_config_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Result<Response, ApiError> {
    require_secret(&headers, auth.auth.as_deref(), &state.config.admin_secret)?;
    Ok(Json(state.settings.get()).into_response())
}

async fn admin_config_put(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_secret(&headers, auth.auth.as_deref(), &state.config.admin_secret)?;
    let Json(partial) = body.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let updated = state.settings.update(&partial)?;
    Ok(Json(updated).into_response())
}

async fn admin_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
) -> Result<Response, ApiError> {
    require_secret(&headers, auth.auth.as_deref(), &state.config.admin_secret)?;
    Ok(Json(admin::dashboard(&state)?).into_response())
}

#[derive(Debug, Deserialize)]
struct ActionBody {
    action: String,
    #[serde(default)]
    params: Value,
}

async fn admin_actions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(auth): Query<AuthQuery>,
    body: Result<Json<ActionBody>, JsonRejection>,
) -> Result<Response, ApiError> {
    require_secret(&headers, auth.auth.as_deref(), &state.config.admin_secret)?;
    let Json(body) = body.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let result = admin::execute_action(&state, &body.action, &body.params);
    Ok(Json(result).into_response())
}
