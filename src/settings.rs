//! Persistent, hot-reloadable runtime settings.
//!
//! Settings live as a single row in the `config` table. On first boot the
//! defaults are materialized and environment overrides applied; afterwards
//! the persisted row wins and changes arrive only through the admin surface.
//! Consumers call accessors each cycle; there are no change notifications.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::store::{Store, StoreError};

const SETTINGS_KEY: &str = "settings";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("settings persistence failed: {0}")]
    Store(#[from] StoreError),
    #[error("invalid settings payload: {0}")]
    Invalid(String),
}

/// Rollup interval tokens accepted by the metrics engine.
pub const ROLLUP_INTERVALS: [&str; 4] = ["1m", "5m", "15m", "1h"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetricsSettings {
    /// One of `1m`, `5m`, `15m`, `1h`.
    pub rollup_interval: String,
    pub retention_days: u32,
    pub rollup_retention_days: u32,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            rollup_interval: "5m".to_string(),
            retention_days: 7,
            rollup_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointLimit {
    pub max_requests: u32,
    pub window_seconds: u32,
}

impl Default for EndpointLimit {
    fn default() -> Self {
        Self { max_requests: 60, window_seconds: 60 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    /// Endpoint key (`"METHOD /path"`) to its fixed-window rule.
    pub limits: BTreeMap<String, EndpointLimit>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        let mut limits = BTreeMap::new();
        limits.insert(
            "POST /v1/events".to_string(),
            EndpointLimit { max_requests: 120, window_seconds: 60 },
        );
        limits.insert(
            "GET /v1/events".to_string(),
            EndpointLimit { max_requests: 60, window_seconds: 60 },
        );
        limits.insert(
            "GET /v1/events/latest".to_string(),
            EndpointLimit { max_requests: 120, window_seconds: 60 },
        );
        limits.insert(
            "GET /v1/metrics".to_string(),
            EndpointLimit { max_requests: 30, window_seconds: 60 },
        );
        Self { enabled: true, limits }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MonitoringSettings {
    /// Parser heartbeat considered stale after this many seconds.
    pub parser_timeout_seconds: u32,
    /// Feed considered stale after this many seconds without a message.
    pub feed_timeout_seconds: u32,
    pub cleanup_interval_hours: u32,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            parser_timeout_seconds: 120,
            feed_timeout_seconds: 180,
            cleanup_interval_hours: 6,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub metrics: MetricsSettings,
    pub rate_limit: RateLimitSettings,
    pub monitoring: MonitoringSettings,
}

impl Settings {
    pub fn rollup_interval_secs(&self) -> i64 {
        match self.metrics.rollup_interval.as_str() {
            "1m" => 60,
            "15m" => 900,
            "1h" => 3600,
            _ => 300,
        }
    }

    pub fn rollup_interval_ms(&self) -> i64 {
        self.rollup_interval_secs() * 1000
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if !ROLLUP_INTERVALS.contains(&self.metrics.rollup_interval.as_str()) {
            return Err(SettingsError::Invalid(format!(
                "rollupInterval must be one of {ROLLUP_INTERVALS:?}"
            )));
        }
        for (name, days) in [
            ("retentionDays", self.metrics.retention_days),
            ("rollupRetentionDays", self.metrics.rollup_retention_days),
        ] {
            if !(1..=365).contains(&days) {
                return Err(SettingsError::Invalid(format!("{name} must be in 1..=365")));
            }
        }
        for (endpoint, limit) in &self.rate_limit.limits {
            if limit.window_seconds == 0 {
                return Err(SettingsError::Invalid(format!(
                    "windowSeconds for {endpoint} must be positive"
                )));
            }
        }
        Ok(())
    }
}

/// Applies known environment overrides onto defaults. Unknown keys and
/// out-of-range values are ignored. Only called when no persisted row exists.
pub fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(interval) = lookup("METRICS_ROLLUP_INTERVAL") {
        if ROLLUP_INTERVALS.contains(&interval.as_str()) {
            settings.metrics.rollup_interval = interval;
        }
    }
    if let Some(days) = lookup("METRICS_RETENTION_DAYS").and_then(|v| v.parse::<u32>().ok()) {
        if (1..=365).contains(&days) {
            settings.metrics.retention_days = days;
        }
    }
    if let Some(days) = lookup("ROLLUP_RETENTION_DAYS").and_then(|v| v.parse::<u32>().ok()) {
        if (1..=365).contains(&days) {
            settings.metrics.rollup_retention_days = days;
        }
    }
    if let Some(enabled) = lookup("RATE_LIMIT_ENABLED") {
        match enabled.to_ascii_lowercase().as_str() {
            "true" => settings.rate_limit.enabled = true,
            "false" => settings.rate_limit.enabled = false,
            _ => {}
        }
    }
}

pub struct SettingsManager {
    store: Arc<Store>,
    current: RwLock<Settings>,
}

impl SettingsManager {
    /// Loads the persisted settings row, or materializes defaults with
    /// environment overrides and persists them.
    pub fn new(store: Arc<Store>) -> Result<Self, SettingsError> {
        let persisted = store.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![SETTINGS_KEY],
                |r| r.get::<_, String>(0),
            )
            .optional()
        })?;

        let settings = match persisted.and_then(|raw| serde_json::from_str::<Settings>(&raw).ok()) {
            Some(settings) => settings,
            None => {
                let mut settings = Settings::default();
                apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
                persist(&store, &settings)?;
                settings
            }
        };

        Ok(Self { store, current: RwLock::new(settings) })
    }

    /// Deep copy of the current settings.
    pub fn get(&self) -> Settings {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Deep-merges `partial` into the current settings, validates, persists
    /// immediately and returns the merged result.
    pub fn update(&self, partial: &Value) -> Result<Settings, SettingsError> {
        let mut current = self.current.write().expect("settings lock poisoned");
        let mut merged_value = serde_json::to_value(&*current)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        deep_merge(&mut merged_value, partial);
        let merged: Settings = serde_json::from_value(merged_value)
            .map_err(|e| SettingsError::Invalid(e.to_string()))?;
        merged.validate()?;
        persist(&self.store, &merged)?;
        *current = merged.clone();
        Ok(merged)
    }
}

fn persist(store: &Store, settings: &Settings) -> Result<(), SettingsError> {
    let value = serde_json::to_string(settings)
        .map_err(|e| SettingsError::Invalid(e.to_string()))?;
    store.with_conn(|conn| {
        conn.execute(
            "INSERT INTO config (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![SETTINGS_KEY, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    })?;
    Ok(())
}

/// Object-wise recursive merge; non-object values in `patch` replace the
/// target outright, matching how the admin surface submits partial updates.
fn deep_merge(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, patch_value),
                    None => {
                        target_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (target_slot, patch_value) => *target_slot = patch_value.clone(),
    }
}
