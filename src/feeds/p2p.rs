//! Normalizer for the P2P relay (P2PQUAKE v2 wire format).
//!
//! Frames are JSON objects tagged with a numeric `code`. Only the allow-listed
//! codes become events; everything else (peer chatter, unknown codes) is
//! ignored. User-perception reports (561) carry no epicenter, and
//! area-detection aggregates (9611) carry peer counts instead of hypocenter
//! data, so both take their own paths.

use chrono::Utc;
use serde_json::{json, Value};

use crate::model::{lenient_f64, lenient_i64, normalize_timestamp, Event, Source};

use super::FrameOutcome;

/// Upstream codes the engine ingests.
const ALLOWED_CODES: [i64; 5] = [551, 552, 556, 561, 9611];

pub fn normalize(raw: &str) -> FrameOutcome {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return FrameOutcome::Ignored;
    };
    let Some(code) = lenient_i64(value.get("code")) else {
        return FrameOutcome::Ignored;
    };
    if !ALLOWED_CODES.contains(&code) {
        return FrameOutcome::Ignored;
    }

    let event = match code {
        551 => normalize_quake(&value),
        552 => normalize_tsunami(&value),
        556 => normalize_eew(&value),
        561 => normalize_user_report(&value),
        9611 => normalize_user_aggregate(&value),
        _ => None,
    };
    match event {
        Some(event) => FrameOutcome::Events(vec![event]),
        None => FrameOutcome::Ignored,
    }
}

/// Base event with the fields every P2P frame shares.
fn base_event(value: &Value, code: i64, kind: &str) -> Option<Event> {
    let time = value
        .get("time")
        .and_then(Value::as_str)
        .and_then(normalize_timestamp)?;
    let issue_time = value
        .pointer("/issue/time")
        .and_then(Value::as_str)
        .and_then(normalize_timestamp);

    let event_id = match value.get("id").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => format!("p2p-{id}"),
        _ => Event::synthetic_id(
            Source::P2pQuake,
            &time,
            None,
            None,
            None,
            &code.to_string(),
            "",
        ),
    };

    Some(Event {
        event_id,
        source: Source::P2pQuake,
        receive_source: "P2P".to_string(),
        r#type: kind.to_string(),
        report_type: Some(json!(code)),
        time,
        issue_time,
        receive_time: Utc::now(),
        latitude: None,
        longitude: None,
        magnitude: None,
        depth: None,
        intensity: None,
        region: None,
        advisory: None,
        revision: None,
    })
}

/// 551: earthquake information with hypocenter and observed intensities.
fn normalize_quake(value: &Value) -> Option<Event> {
    let mut event = base_event(value, 551, "information")?;

    if let Some(quake_time) = value
        .pointer("/earthquake/time")
        .and_then(Value::as_str)
        .and_then(normalize_timestamp)
    {
        event.time = quake_time;
    }
    if let Some(issue_type) = value.pointer("/issue/type").and_then(Value::as_str) {
        event.report_type = Some(json!(issue_type));
    }

    let hypocenter = value.pointer("/earthquake/hypocenter");
    event.latitude = coordinate(hypocenter, "latitude", 90.0);
    event.longitude = coordinate(hypocenter, "longitude", 180.0);
    event.depth = non_negative(hypocenter, "depth");
    event.magnitude = non_negative(hypocenter, "magnitude");
    event.region = hypocenter
        .and_then(|h| h.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    // maxScale is the JMA seismic scale times ten; -1 means unknown.
    event.intensity = lenient_f64(value.pointer("/earthquake/maxScale"))
        .filter(|v| *v >= 0.0)
        .map(|v| v / 10.0);
    event.advisory = value
        .pointer("/earthquake/domesticTsunami")
        .and_then(Value::as_str)
        .map(str::to_string);
    event.revision = value
        .pointer("/issue/correct")
        .and_then(Value::as_str)
        .filter(|c| *c != "None")
        .map(str::to_string);

    Some(event)
}

/// 552: tsunami advisory; no epicenter, regions come from the warned areas.
fn normalize_tsunami(value: &Value) -> Option<Event> {
    let mut event = base_event(value, 552, "tsunami")?;
    let areas = value.get("areas").and_then(Value::as_array);
    event.region = areas
        .and_then(|a| a.first())
        .and_then(|a| a.get("name"))
        .and_then(Value::as_str)
        .map(str::to_string);
    event.advisory = if value.get("cancelled").and_then(Value::as_bool).unwrap_or(false) {
        Some("cancel".to_string())
    } else {
        areas
            .and_then(|a| a.first())
            .and_then(|a| a.get("grade"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    Some(event)
}

/// 556: emergency earthquake warning.
fn normalize_eew(value: &Value) -> Option<Event> {
    let mut event = base_event(value, 556, "EEW")?;

    if let Some(origin) = value
        .pointer("/earthquake/originTime")
        .and_then(Value::as_str)
        .and_then(normalize_timestamp)
    {
        event.time = origin;
    }

    let hypocenter = value.pointer("/earthquake/hypocenter");
    event.latitude = coordinate(hypocenter, "latitude", 90.0);
    event.longitude = coordinate(hypocenter, "longitude", 180.0);
    event.depth = non_negative(hypocenter, "depth");
    event.magnitude = non_negative(hypocenter, "magnitude");
    event.region = hypocenter
        .and_then(|h| h.get("name"))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    event.advisory = if value.get("cancelled").and_then(Value::as_bool).unwrap_or(false) {
        Some("cancel".to_string())
    } else {
        Some("warning".to_string())
    };
    event.revision = value
        .pointer("/issue/serial")
        .map(|s| match s {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .filter(|s| !s.is_empty());

    Some(event)
}

/// 561: a user-perception report. No epicenter by construction.
fn normalize_user_report(value: &Value) -> Option<Event> {
    let mut event = base_event(value, 561, "UserReport")?;
    event.region = lenient_i64(value.get("area")).map(|a| a.to_string());
    Some(event)
}

/// 9611: area-detection aggregate over peer reports; the peer count is the
/// payload of interest.
fn normalize_user_aggregate(value: &Value) -> Option<Event> {
    let mut event = base_event(value, 9611, "UserReportAggregate")?;
    if let Some(count) = lenient_i64(value.get("count")) {
        event.report_type = Some(json!({ "code": 9611, "count": count }));
    }
    event.advisory = lenient_f64(value.get("confidence")).map(|c| format!("confidence {c:.2}"));
    Some(event)
}

/// Hypocenter coordinate with the upstream unknown-sentinel filtered out.
fn coordinate(hypocenter: Option<&Value>, field: &str, bound: f64) -> Option<f64> {
    lenient_f64(hypocenter.and_then(|h| h.get(field))).filter(|v| v.abs() <= bound)
}

/// Depth/magnitude where the upstream encodes unknown as -1.
fn non_negative(hypocenter: Option<&Value>, field: &str) -> Option<f64> {
    lenient_f64(hypocenter.and_then(|h| h.get(field))).filter(|v| *v >= 0.0)
}
