//! Canaria: an earthquake bulletin aggregation and signed fan-out engine.
//!
//! The engine ingests bulletins from independent authority and relay feeds,
//! deduplicates them into a single canonical event stream backed by an
//! embedded SQLite store, and fans the stream out to WebSocket subscribers as
//! Ed25519-signed envelopes. A bounded backup projection keeps read clients
//! alive when the engine is unreachable.

pub mod admin;
pub mod backup;
pub mod config;
pub mod feeds;
pub mod http;
pub mod hub;
pub mod ingest;
pub mod logger;
pub mod metrics;
pub mod model;
pub mod ratelimit;
pub mod settings;
pub mod signer;
pub mod store;

pub use config::Config;
pub use http::AppState;
pub use hub::ConnectionHub;
pub use ingest::Ingest;
pub use metrics::Metrics;
pub use model::{Event, Heartbeat, SignedEnvelope, Source};
pub use ratelimit::RateLimiter;
pub use settings::{Settings, SettingsManager};
pub use signer::Signer;
pub use store::{EventQuery, Store};
