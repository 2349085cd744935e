//! Canonical data model shared across the engine: the normalized earthquake
//! event, poller heartbeats, signed envelopes and the WebSocket wire frames.

use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Logical bulletin authority, distinct from the concrete feed delivering it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Source {
    #[serde(rename = "KMA")]
    Kma,
    #[serde(rename = "JMA")]
    Jma,
    #[serde(rename = "P2PQUAKE")]
    P2pQuake,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Kma => "KMA",
            Source::Jma => "JMA",
            Source::P2pQuake => "P2PQUAKE",
        }
    }

    pub fn parse(s: &str) -> Option<Source> {
        match s.to_ascii_uppercase().as_str() {
            "KMA" => Some(Source::Kma),
            "JMA" => Some(Source::Jma),
            "P2PQUAKE" => Some(Source::P2pQuake),
            _ => None,
        }
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A canonical earthquake observation.
///
/// `event_id` is stable across restarts for the same logical event; numeric
/// fields keep null distinct from zero.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub event_id: String,
    pub source: Source,
    /// Concrete feed the event arrived on (WolfX, P2P, KMA).
    pub receive_source: String,
    /// Free-form classification: EEW, information, UserReport, numeric code.
    pub r#type: String,
    /// Authority-specific sub-classification; string or number upstream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_type: Option<Value>,
    /// Event origin time, UTC.
    pub time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issue_time: Option<DateTime<Utc>>,
    /// Ingestion time, stamped by the core; submitters may omit it.
    #[serde(default = "Utc::now")]
    pub receive_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magnitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intensity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advisory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision: Option<String>,
}

impl Event {
    /// Deterministic replacement id for upstream records that carry none.
    ///
    /// Two ingests of the same logical record must produce the same id, so
    /// the digest covers only upstream-provided fields (never receive time).
    pub fn synthetic_id(
        source: Source,
        time: &DateTime<Utc>,
        latitude: Option<f64>,
        longitude: Option<f64>,
        magnitude: Option<f64>,
        code: &str,
        serial: &str,
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(time.to_rfc3339().as_bytes());
        hasher.update(b"|");
        for part in [latitude, longitude, magnitude] {
            match part {
                Some(v) => hasher.update(format!("{v:.4}").as_bytes()),
                None => hasher.update(b"-"),
            }
            hasher.update(b"|");
        }
        hasher.update(code.as_bytes());
        hasher.update(b"|");
        hasher.update(serial.as_bytes());
        let digest = hasher.finalize();
        format!("{}-{}", source.as_str(), hex::encode(&digest[..8]))
    }
}

/// Liveness report from the external authenticated poller. Held in memory
/// only; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub authority_reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_parse_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<f64>,
    /// Fraction of parse attempts that succeeded, in `[0, 1]`. Only the
    /// poller can compute this, so it arrives on the wire like `delay_ms`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<Value>,
}

/// Body of a poller submission: a heartbeat, a batch of already-normalized
/// events, or both.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    #[serde(default)]
    pub heartbeat: Option<Heartbeat>,
    #[serde(default)]
    pub events: Option<Vec<Event>>,
}

/// Ed25519-signed envelope around a serialized event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedEnvelope {
    /// Deterministic string serialization of the signed value.
    pub payload: String,
    /// base64(Ed25519(payload)).
    pub signature: String,
    /// Milliseconds since epoch at signing time.
    pub timestamp: i64,
}

/// Server → client WebSocket frames.
pub mod frames {
    use super::{Event, SignedEnvelope};
    use serde_json::json;

    pub fn ping(ts_ms: i64) -> String {
        json!({ "type": "ping", "ts": ts_ms }).to_string()
    }

    /// Single most-recent event, sent once on subscriber handshake.
    pub fn snapshot(event: &Event) -> String {
        json!({ "event": event }).to_string()
    }

    pub fn signed_events(envelopes: &[SignedEnvelope]) -> String {
        json!({ "signedEvents": envelopes }).to_string()
    }
}

/// Lenient numeric parse: upstream feeds interchange numbers and numeric
/// strings freely. Anything non-finite comes back as `None`.
pub fn lenient_f64(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    parsed.is_finite().then_some(parsed)
}

/// Lenient integer parse for upstream code fields.
pub fn lenient_i64(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

const JST_OFFSET_SECS: i32 = 9 * 3600;

/// Parse an upstream timestamp into UTC. Offsets are honored when present;
/// bare local timestamps are assumed JST per the upstream authorities.
pub fn normalize_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let jst = FixedOffset::east_opt(JST_OFFSET_SECS)?;
    for fmt in [
        "%Y/%m/%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y/%m/%d %H:%M",
        "%Y%m%d%H%M%S",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            if let Some(dt) = jst.from_local_datetime(&naive).single() {
                return Some(dt.with_timezone(&Utc));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn synthetic_id_is_deterministic() {
        let t = Utc.with_ymd_and_hms(2024, 3, 11, 5, 46, 0).unwrap();
        let a = Event::synthetic_id(Source::Jma, &t, Some(38.1), Some(142.9), Some(7.2), "551", "3");
        let b = Event::synthetic_id(Source::Jma, &t, Some(38.1), Some(142.9), Some(7.2), "551", "3");
        assert_eq!(a, b);
        assert!(a.starts_with("JMA-"));

        let c = Event::synthetic_id(Source::Jma, &t, Some(38.1), Some(142.9), Some(7.2), "551", "4");
        assert_ne!(a, c);
    }

    #[test]
    fn lenient_numbers_accept_strings_and_reject_junk() {
        assert_eq!(lenient_f64(Some(&serde_json::json!(5.9))), Some(5.9));
        assert_eq!(lenient_f64(Some(&serde_json::json!("5.9"))), Some(5.9));
        assert_eq!(lenient_f64(Some(&serde_json::json!(" 10 "))), Some(10.0));
        assert_eq!(lenient_f64(Some(&serde_json::json!("強い"))), None);
        assert_eq!(lenient_f64(Some(&serde_json::json!(null))), None);
        assert_eq!(lenient_f64(None), None);
    }

    #[test]
    fn bare_timestamps_are_jst() {
        let dt = normalize_timestamp("2024/03/11 09:00:00").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());

        let with_millis = normalize_timestamp("2024/03/11 09:00:00.500").unwrap();
        assert_eq!(with_millis.timestamp_millis() % 1000, 500);
    }

    #[test]
    fn offset_timestamps_are_honored() {
        let dt = normalize_timestamp("2024-03-11T00:00:00Z").unwrap();
        assert_eq!(dt, Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap());
    }

    #[test]
    fn event_round_trips_camel_case() {
        let e = Event {
            event_id: "JMA-abc".into(),
            source: Source::Jma,
            receive_source: "WolfX".into(),
            r#type: "EEW".into(),
            report_type: Some(serde_json::json!("予報")),
            time: Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap(),
            issue_time: None,
            receive_time: Utc.with_ymd_and_hms(2024, 3, 11, 0, 0, 5).unwrap(),
            latitude: Some(38.1),
            longitude: Some(142.9),
            magnitude: Some(7.2),
            depth: Some(10.0),
            intensity: None,
            region: Some("三陸沖".into()),
            advisory: None,
            revision: Some("3".into()),
        };
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["eventId"], "JMA-abc");
        assert_eq!(v["source"], "JMA");
        assert_eq!(v["receiveSource"], "WolfX");
        assert_eq!(v["type"], "EEW");
        assert!(v.get("issueTime").is_none());

        let back: Event = serde_json::from_value(v).unwrap();
        assert_eq!(back.event_id, e.event_id);
        assert_eq!(back.intensity, None);
    }
}
