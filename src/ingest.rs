//! Ingest pipeline: the single write path into the store and out to
//! subscribers.
//!
//! Batches arrive from two places: the feed connectors (over a channel) and
//! the authenticated upstream poller (`submit`). Every batch goes through the
//! same pipeline: stamp receive time, insert with dedup, and only for rows
//! that actually materialized sign and broadcast, then schedule a backup
//! projection upload. The poller's heartbeat, the parser-error ring and the
//! one-shot authority-sync flag live here and are mutated only from the
//! submit path.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::backup::{BackupUploader, PROJECTION_LIMIT};
use crate::hub::ConnectionHub;
use crate::model::{frames, Event, Heartbeat, SubmitBody};
use crate::signer::Signer;
use crate::store::{Store, StoreError};

/// Bound on the retained parser-error ring.
const MAX_PARSER_ERRORS: usize = 10;

/// Heartbeat as last received, plus when the core received it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatSnapshot {
    #[serde(flatten)]
    pub heartbeat: Heartbeat,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParserError {
    pub timestamp: DateTime<Utc>,
    pub error: String,
}

/// Result of one poller submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitOutcome {
    /// True exactly once per process lifetime: the first heartbeat that
    /// reports the authority reachable. The poller answers by sending its
    /// full current state instead of deltas.
    pub sync: bool,
    pub inserted: usize,
}

pub struct Ingest {
    store: Arc<Store>,
    signer: Arc<Signer>,
    hub: Arc<ConnectionHub>,
    backup: Arc<BackupUploader>,
    heartbeat: Mutex<Option<HeartbeatSnapshot>>,
    parser_errors: Mutex<VecDeque<ParserError>>,
    needs_authority_sync: AtomicBool,
    last_stored_at: Mutex<Option<DateTime<Utc>>>,
}

impl Ingest {
    pub fn new(
        store: Arc<Store>,
        signer: Arc<Signer>,
        hub: Arc<ConnectionHub>,
        backup: Arc<BackupUploader>,
    ) -> Self {
        Self {
            store,
            signer,
            hub,
            backup,
            heartbeat: Mutex::new(None),
            parser_errors: Mutex::new(VecDeque::new()),
            needs_authority_sync: AtomicBool::new(true),
            last_stored_at: Mutex::new(None),
        }
    }

    /// Runs one batch through the pipeline. Returns the number of rows that
    /// actually materialized; duplicates broadcast nothing.
    pub fn ingest_batch(&self, mut events: Vec<Event>) -> Result<usize, StoreError> {
        if events.is_empty() {
            return Ok(0);
        }
        let now = Utc::now();
        // Receive time is authoritative from the core, whatever upstream sent.
        for event in &mut events {
            event.receive_time = now;
        }

        let fresh_ids = self.store.insert_fresh(&events)?;
        if fresh_ids.is_empty() {
            return Ok(0);
        }

        *self.last_stored_at.lock().expect("ingest lock poisoned") = Some(now);

        // Only rows that actually materialized go out; an already-persisted
        // event re-delivered by a flapping feed is never re-broadcast.
        let mut fresh: std::collections::HashSet<&str> =
            fresh_ids.iter().map(String::as_str).collect();
        let envelopes: Vec<_> = events
            .iter()
            .filter(|e| fresh.remove(e.event_id.as_str()))
            .map(|e| self.signer.sign_event(e))
            .collect();
        self.hub.broadcast(&frames::signed_events(&envelopes));

        match self.store.recent(PROJECTION_LIMIT) {
            Ok(projection) => self.backup.clone().spawn_upload(projection),
            Err(e) => log::warn!("backup projection query failed: {e}"),
        }

        Ok(fresh_ids.len())
    }

    /// Poller submission: heartbeat bookkeeping plus the regular pipeline.
    pub fn submit(&self, body: SubmitBody) -> Result<SubmitOutcome, StoreError> {
        let mut sync = false;
        if let Some(heartbeat) = body.heartbeat {
            if let Some(error) = &heartbeat.error {
                self.push_parser_error(error.clone());
            }
            if heartbeat.authority_reachable {
                // Atomic read-then-clear: the sync signal fires exactly once.
                sync = self
                    .needs_authority_sync
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok();
            }
            *self.heartbeat.lock().expect("ingest lock poisoned") = Some(HeartbeatSnapshot {
                heartbeat,
                received_at: Utc::now(),
            });
        }

        let inserted = match body.events {
            Some(events) => self.ingest_batch(events)?,
            None => 0,
        };

        Ok(SubmitOutcome { sync, inserted })
    }

    /// Consumer task for the connector event channel.
    pub fn run(
        self: Arc<Self>,
        mut events_rx: mpsc::UnboundedReceiver<Vec<Event>>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    batch = events_rx.recv() => {
                        let Some(batch) = batch else { break };
                        match self.ingest_batch(batch) {
                            Ok(0) => {}
                            Ok(n) => log::info!("ingested {n} events from feeds"),
                            // Storage failure: skip the batch, keep running.
                            Err(e) => log::error!("feed batch insert failed: {e}"),
                        }
                    }
                }
            }
        })
    }

    fn push_parser_error(&self, error: String) {
        let mut ring = self.parser_errors.lock().expect("ingest lock poisoned");
        ring.push_front(ParserError { timestamp: Utc::now(), error });
        ring.truncate(MAX_PARSER_ERRORS);
    }

    pub fn heartbeat_snapshot(&self) -> Option<HeartbeatSnapshot> {
        self.heartbeat.lock().expect("ingest lock poisoned").clone()
    }

    /// Seconds since the last heartbeat arrived, if any.
    pub fn heartbeat_age_secs(&self) -> Option<f64> {
        self.heartbeat_snapshot()
            .map(|h| (Utc::now() - h.received_at).num_milliseconds().max(0) as f64 / 1000.0)
    }

    /// Most recent parser errors, newest first, bounded at `limit`.
    pub fn parser_errors(&self, limit: usize) -> Vec<ParserError> {
        let ring = self.parser_errors.lock().expect("ingest lock poisoned");
        ring.iter().take(limit).cloned().collect()
    }

    pub fn last_stored_at(&self) -> Option<DateTime<Utc>> {
        *self.last_stored_at.lock().expect("ingest lock poisoned")
    }
}
