//! Normalizer for the WolfX JMA EEW relay.
//!
//! The relay emits one JSON object per frame: `jma_eew` payloads carrying a
//! forecast/warning update, plus `heartbeat`/`pong` liveness frames that must
//! be answered but never ingested.

use chrono::Utc;
use serde_json::Value;

use crate::model::{lenient_f64, normalize_timestamp, Event, Source};

use super::FrameOutcome;

pub fn normalize(raw: &str) -> FrameOutcome {
    let Ok(value) = serde_json::from_str::<Value>(raw) else {
        return FrameOutcome::Ignored;
    };

    match value.get("type").and_then(Value::as_str) {
        Some("heartbeat") | Some("pong") => FrameOutcome::Heartbeat,
        Some("jma_eew") => match normalize_eew(&value) {
            Some(event) => FrameOutcome::Events(vec![event]),
            None => FrameOutcome::Ignored,
        },
        _ => FrameOutcome::Ignored,
    }
}

fn normalize_eew(value: &Value) -> Option<Event> {
    // Drill and assumed-hypocenter frames are relay noise, not observations.
    if value.get("isTraining").and_then(Value::as_bool).unwrap_or(false) {
        return None;
    }

    let origin = value.get("OriginTime").and_then(Value::as_str);
    let announced = value.get("AnnouncedTime").and_then(Value::as_str);
    let time = origin
        .and_then(normalize_timestamp)
        .or_else(|| announced.and_then(normalize_timestamp))?;
    let issue_time = announced.and_then(normalize_timestamp);

    let latitude = lenient_f64(value.get("Latitude"));
    let longitude = lenient_f64(value.get("Longitude"));
    // The relay spells the field "Magunitude"; accept the correction too.
    let magnitude = lenient_f64(value.get("Magunitude"))
        .or_else(|| lenient_f64(value.get("Magnitude")));
    let depth = lenient_f64(value.get("Depth"));
    let intensity = lenient_f64(value.get("MaxIntensity"));

    let serial = value
        .get("Serial")
        .map(|s| match s {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();

    let event_id = match value.get("EventID").and_then(Value::as_str) {
        Some(id) if !id.is_empty() => format!("jma-{id}-{serial}"),
        _ => Event::synthetic_id(
            Source::Jma,
            &time,
            latitude,
            longitude,
            magnitude,
            "jma_eew",
            &serial,
        ),
    };

    let advisory = if value.get("isCancel").and_then(Value::as_bool).unwrap_or(false) {
        "cancel"
    } else if value.get("isWarn").and_then(Value::as_bool).unwrap_or(false) {
        "warning"
    } else if value.get("isFinal").and_then(Value::as_bool).unwrap_or(false) {
        "final"
    } else {
        "forecast"
    };

    Some(Event {
        event_id,
        source: Source::Jma,
        receive_source: "WolfX".to_string(),
        r#type: "EEW".to_string(),
        report_type: value.get("Title").cloned().filter(|v| !v.is_null()),
        time,
        issue_time,
        receive_time: Utc::now(),
        latitude,
        longitude,
        magnitude,
        depth,
        intensity,
        region: value
            .get("Hypocenter")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        advisory: Some(advisory.to_string()),
        revision: (!serial.is_empty()).then_some(serial),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn eew_frame() -> Value {
        json!({
            "type": "jma_eew",
            "Title": "緊急地震速報(警報)",
            "Issue": { "Source": "東京", "Status": "通常" },
            "EventID": "20240311045930",
            "Serial": 3,
            "AnnouncedTime": "2024/03/11 05:00:05",
            "OriginTime": "2024/03/11 04:59:30",
            "Hypocenter": "三陸沖",
            "Latitude": 38.1,
            "Longitude": "142.9",
            "Magunitude": 7.2,
            "Depth": 10,
            "MaxIntensity": "6",
            "isSea": true,
            "isTraining": false,
            "isWarn": true,
            "isFinal": false,
            "isCancel": false
        })
    }

    #[test]
    fn eew_frame_normalizes() {
        let FrameOutcome::Events(events) = normalize(&eew_frame().to_string()) else {
            panic!("expected events");
        };
        let e = &events[0];
        assert_eq!(e.event_id, "jma-20240311045930-3");
        assert_eq!(e.source, Source::Jma);
        assert_eq!(e.receive_source, "WolfX");
        assert_eq!(e.r#type, "EEW");
        // 04:59:30 JST == 19:59:30 UTC the previous day.
        assert_eq!(e.time, Utc.with_ymd_and_hms(2024, 3, 10, 19, 59, 30).unwrap());
        assert_eq!(e.longitude, Some(142.9));
        assert_eq!(e.magnitude, Some(7.2));
        assert_eq!(e.intensity, Some(6.0));
        assert_eq!(e.region.as_deref(), Some("三陸沖"));
        assert_eq!(e.advisory.as_deref(), Some("warning"));
        assert_eq!(e.revision.as_deref(), Some("3"));
    }

    #[test]
    fn heartbeat_frames_request_pong() {
        assert!(matches!(
            normalize(r#"{"type":"heartbeat","ver":"1.1"}"#),
            FrameOutcome::Heartbeat
        ));
        assert!(matches!(normalize(r#"{"type":"pong"}"#), FrameOutcome::Heartbeat));
    }

    #[test]
    fn training_and_unknown_frames_are_ignored() {
        let mut drill = eew_frame();
        drill["isTraining"] = json!(true);
        assert!(matches!(normalize(&drill.to_string()), FrameOutcome::Ignored));
        assert!(matches!(normalize(r#"{"type":"sc_eew"}"#), FrameOutcome::Ignored));
        assert!(matches!(normalize("not json"), FrameOutcome::Ignored));
    }

    #[test]
    fn missing_event_id_gets_synthetic_id() {
        let mut frame = eew_frame();
        frame["EventID"] = json!("");
        let FrameOutcome::Events(a) = normalize(&frame.to_string()) else {
            panic!("expected events");
        };
        let FrameOutcome::Events(b) = normalize(&frame.to_string()) else {
            panic!("expected events");
        };
        assert_eq!(a[0].event_id, b[0].event_id);
        assert!(a[0].event_id.starts_with("JMA-"));
    }

    #[test]
    fn textual_intensity_stays_null() {
        let mut frame = eew_frame();
        frame["MaxIntensity"] = json!("5強");
        let FrameOutcome::Events(events) = normalize(&frame.to_string()) else {
            panic!("expected events");
        };
        assert_eq!(events[0].intensity, None);
    }

    #[test]
    fn cancel_beats_warning() {
        let mut frame = eew_frame();
        frame["isCancel"] = json!(true);
        let FrameOutcome::Events(events) = normalize(&frame.to_string()) else {
            panic!("expected events");
        };
        assert_eq!(events[0].advisory.as_deref(), Some("cancel"));
    }
}
