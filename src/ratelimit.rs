//! Fixed-window request limiter backed by the store.
//!
//! Counters are keyed by client IP and endpoint (separate columns, so IPv6
//! addresses with their `:` separators aggregate correctly) with the window
//! start recorded alongside; a window change implicitly resets the counter.
//! The first request in a window always passes and sets the counter to 1; a
//! denied request does not increment. No token-bucket or sliding-window
//! behavior — the window shape is part of the external contract.

use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use crate::settings::SettingsManager;
use crate::store::{Store, StoreError};

/// Outcome of a limiter consultation, including the header values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Absolute unix seconds at which the current window closes.
    pub reset_at: i64,
}

impl Decision {
    fn unlimited() -> Self {
        Self { allowed: true, limit: 0, remaining: 0, reset_at: 0 }
    }

    pub fn retry_after_secs(&self, now: i64) -> i64 {
        (self.reset_at - now).max(0)
    }
}

/// Aggregated request count for one client IP.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TopIp {
    pub ip: String,
    pub count: i64,
}

pub struct RateLimiter {
    store: Arc<Store>,
    settings: Arc<SettingsManager>,
}

impl RateLimiter {
    pub fn new(store: Arc<Store>, settings: Arc<SettingsManager>) -> Self {
        Self { store, settings }
    }

    /// Consults and, when allowed, charges the counter for `(ip, endpoint)`.
    pub fn check(&self, ip: &str, endpoint: &str) -> Result<Decision, StoreError> {
        self.check_at(ip, endpoint, Utc::now().timestamp())
    }

    /// Clock-injected variant of [`check`](Self::check) so window-edge
    /// behavior is testable.
    pub fn check_at(&self, ip: &str, endpoint: &str, now: i64) -> Result<Decision, StoreError> {
        let settings = self.settings.get();
        if !settings.rate_limit.enabled {
            return Ok(Decision::unlimited());
        }
        let Some(rule) = settings.rate_limit.limits.get(endpoint).copied() else {
            return Ok(Decision::unlimited());
        };

        let window = i64::from(rule.window_seconds);
        let window_start = now - now.rem_euclid(window);
        let reset_at = window_start + window;

        self.store.with_conn(|conn| {
            let row: Option<(i64, i64)> = conn
                .query_row(
                    "SELECT count, window_start FROM rate_limits
                     WHERE ip = ?1 AND endpoint = ?2",
                    params![ip, endpoint],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            // A counter from an earlier window counts as zero.
            let count = match row {
                Some((count, start)) if start == window_start => count,
                _ => 0,
            };

            if count >= i64::from(rule.max_requests) {
                return Ok(Decision {
                    allowed: false,
                    limit: rule.max_requests,
                    remaining: 0,
                    reset_at,
                });
            }

            conn.execute(
                "INSERT INTO rate_limits (ip, endpoint, count, window_start)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(ip, endpoint) DO UPDATE SET
                     count = CASE WHEN rate_limits.window_start = ?3
                                  THEN rate_limits.count + 1 ELSE 1 END,
                     window_start = ?3",
                params![ip, endpoint, window_start],
            )?;

            let charged = count + 1;
            Ok(Decision {
                allowed: true,
                limit: rule.max_requests,
                remaining: (i64::from(rule.max_requests) - charged).max(0) as u32,
                reset_at,
            })
        })
    }

    /// Deletes counters for an IP, optionally narrowed to one endpoint.
    pub fn reset(&self, ip: &str, endpoint: Option<&str>) -> Result<usize, StoreError> {
        self.store.with_conn(|conn| match endpoint {
            Some(endpoint) => conn.execute(
                "DELETE FROM rate_limits WHERE ip = ?1 AND endpoint = ?2",
                params![ip, endpoint],
            ),
            None => conn.execute("DELETE FROM rate_limits WHERE ip = ?1", params![ip]),
        })
    }

    /// Drops counters whose window started more than an hour ago.
    pub fn cleanup(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now().timestamp() - 3600;
        self.store.with_conn(|conn| {
            conn.execute(
                "DELETE FROM rate_limits WHERE window_start < ?1",
                params![cutoff],
            )
        })
    }

    /// Heaviest client IPs by accumulated counter value.
    pub fn top_ips(&self, n: usize) -> Result<Vec<TopIp>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ip, SUM(count) AS total FROM rate_limits
                 GROUP BY ip ORDER BY total DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![n as i64], |r| {
                Ok(TopIp { ip: r.get(0)?, count: r.get(1)? })
            })?;
            rows.collect()
        })
    }
}
