//! Maps parsed alarm frames to typed domain events.
//!
//! Classification is a pure function of the frame, the configured rule
//! filters and the receipt time, so it can be exercised without a camera.

use crate::config::ClassifierConfig;
use crate::multipart::RawEventFrame;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Serialize, Serializer};
use std::path::PathBuf;
use tracing::trace;

/// Kind of a classified event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TrafficCrossing,
    Intrusion,
    Ignored,
}

/// Where an event's timestamp came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampSource {
    Camera,
    Received,
}

/// Media associated with an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum MediaRef {
    /// Snapshot bytes delivered inline on the stream
    Inline(#[serde(serialize_with = "serialize_len")] Bytes),
    /// Snapshot persisted to disk
    File(PathBuf),
}

fn serialize_len<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(bytes.len() as u64)
}

/// A classified event, immutable once handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub timestamp_source: TimestampSource,
    /// Event code reported by the camera
    pub code: String,
    /// IVS rule name, may be empty
    pub rule_name: String,
    /// Crossing direction for tripwire rules
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
    /// Rule index on the camera
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
}

impl DomainEvent {
    pub fn is_ignored(&self) -> bool {
        self.kind == EventKind::Ignored
    }

    /// Identity assigned by the camera, used to recognise replays after a
    /// reconnect. Events timestamped on receipt have no stable identity.
    pub fn replay_key(&self) -> Option<String> {
        if self.timestamp_source != TimestampSource::Camera {
            return None;
        }
        Some(format!(
            "{}|{}|{}|{}",
            self.code,
            self.rule_name,
            self.index.map(|i| i.to_string()).unwrap_or_default(),
            self.timestamp.timestamp_millis()
        ))
    }
}

/// Rule-based classifier for camera alarm frames.
#[derive(Debug, Clone)]
pub struct EventClassifier {
    config: ClassifierConfig,
}

impl EventClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    /// Classify a frame received at `received_at`.
    pub fn classify(&self, frame: &RawEventFrame, received_at: DateTime<Utc>) -> DomainEvent {
        let code = frame.field("Code").unwrap_or_default().to_string();
        let data = frame
            .field("data")
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());

        let rule_name = frame
            .field("name")
            .map(str::to_string)
            .or_else(|| json_str(data.as_ref(), "Name"))
            .unwrap_or_default();

        let (timestamp, timestamp_source) = match camera_timestamp(frame, data.as_ref()) {
            Some(ts) => (ts, TimestampSource::Camera),
            None => (received_at, TimestampSource::Received),
        };

        let mut event = DomainEvent {
            kind: EventKind::Ignored,
            timestamp,
            timestamp_source,
            direction: json_str(data.as_ref(), "Direction"),
            index: frame.field("index").and_then(|i| i.parse().ok()),
            media: None,
            rule_name,
            code,
        };

        if event.code.is_empty() {
            return event;
        }

        if self.config.start_action_only {
            if let Some(action) = frame.field("action") {
                if action != "Start" {
                    trace!(code = %event.code, action = %action, "Ignoring non-start action");
                    return event;
                }
            }
        }

        if event.code == self.config.traffic_code && self.traffic_rule_allowed(&event.rule_name) {
            event.kind = EventKind::TrafficCrossing;
        } else if event.code == self.config.intrusion_code
            && self.config.intrusion_rule.as_deref() == Some(event.rule_name.as_str())
        {
            event.kind = EventKind::Intrusion;
            event.media = frame.payload.clone().map(MediaRef::Inline);
        }

        event
    }

    fn traffic_rule_allowed(&self, rule_name: &str) -> bool {
        self.config.traffic_rules.is_empty()
            || self.config.traffic_rules.iter().any(|r| r == rule_name)
    }
}

fn json_str(data: Option<&serde_json::Value>, key: &str) -> Option<String> {
    data?
        .get(key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn camera_timestamp(
    frame: &RawEventFrame,
    data: Option<&serde_json::Value>,
) -> Option<DateTime<Utc>> {
    let secs = data
        .and_then(|d| d.get("UTC"))
        .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|f| f as i64)))
        .or_else(|| frame.field("UTC").and_then(|v| v.parse().ok()))?;

    if secs <= 0 {
        return None;
    }
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn frame(pairs: &[(&str, &str)]) -> RawEventFrame {
        RawEventFrame {
            fields: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
            ..Default::default()
        }
    }

    fn crossing(rule: &str) -> RawEventFrame {
        let data = format!(
            "{{\"Name\":\"{}\",\"Direction\":\"LeftToRight\",\"UTC\":1700000000}}",
            rule
        );
        frame(&[
            ("Code", "CrossLineDetection"),
            ("action", "Start"),
            ("index", "2"),
            ("data", data.as_str()),
        ])
    }

    fn intrusion(rule: &str) -> RawEventFrame {
        let data = format!("{{\"Name\":\"{}\"}}", rule);
        let mut f = frame(&[
            ("Code", "CrossRegionDetection"),
            ("action", "Start"),
            ("data", data.as_str()),
        ]);
        f.payload = Some(Bytes::from_static(&[0xFF, 0xD8]));
        f
    }

    fn classifier(traffic_rules: &[&str], intrusion_rule: Option<&str>) -> EventClassifier {
        EventClassifier::new(ClassifierConfig {
            traffic_rules: traffic_rules.iter().map(|s| s.to_string()).collect(),
            intrusion_rule: intrusion_rule.map(str::to_string),
            ..ClassifierConfig::default()
        })
    }

    #[test]
    fn test_empty_allow_list_accepts_any_rule() {
        let event = classifier(&[], None).classify(&crossing("Whatever"), Utc::now());
        assert_eq!(event.kind, EventKind::TrafficCrossing);
        assert_eq!(event.rule_name, "Whatever");
        assert_eq!(event.direction.as_deref(), Some("LeftToRight"));
        assert_eq!(event.index, Some(2));
    }

    #[test]
    fn test_rule_absent_from_allow_list_is_ignored() {
        let c = classifier(&["Street", "Driveway"], None);
        assert_eq!(
            c.classify(&crossing("Sidewalk"), Utc::now()).kind,
            EventKind::Ignored
        );
        assert_eq!(
            c.classify(&crossing("Driveway"), Utc::now()).kind,
            EventKind::TrafficCrossing
        );
    }

    #[test]
    fn test_intrusion_attaches_payload() {
        let event = classifier(&[], Some("Garden")).classify(&intrusion("Garden"), Utc::now());
        assert_eq!(event.kind, EventKind::Intrusion);
        assert_eq!(
            event.media,
            Some(MediaRef::Inline(Bytes::from_static(&[0xFF, 0xD8])))
        );
    }

    #[test]
    fn test_intrusion_with_other_rule_is_ignored() {
        let c = classifier(&[], Some("Garden"));
        let event = c.classify(&intrusion("Porch"), Utc::now());
        assert_eq!(event.kind, EventKind::Ignored);
        assert!(event.media.is_none());
    }

    #[test]
    fn test_intrusion_unconfigured_is_ignored() {
        let event = classifier(&[], None).classify(&intrusion("Garden"), Utc::now());
        assert_eq!(event.kind, EventKind::Ignored);
    }

    #[test]
    fn test_uninteresting_code_is_ignored() {
        let f = frame(&[("Code", "VideoMotion"), ("action", "Start")]);
        assert_eq!(
            classifier(&[], None).classify(&f, Utc::now()).kind,
            EventKind::Ignored
        );
    }

    #[test]
    fn test_heartbeat_is_ignored() {
        let event = classifier(&[], None).classify(&RawEventFrame::default(), Utc::now());
        assert!(event.is_ignored());
        assert_eq!(event.timestamp_source, TimestampSource::Received);
    }

    #[test]
    fn test_stop_action_is_ignored() {
        let mut f = crossing("Street");
        f.fields.insert("action".to_string(), "Stop".to_string());
        assert!(classifier(&[], None).classify(&f, Utc::now()).is_ignored());
    }

    #[test]
    fn test_stop_action_counted_when_filter_disabled() {
        let c = EventClassifier::new(ClassifierConfig {
            start_action_only: false,
            ..ClassifierConfig::default()
        });
        let mut f = crossing("Street");
        f.fields.insert("action".to_string(), "Pulse".to_string());
        assert_eq!(c.classify(&f, Utc::now()).kind, EventKind::TrafficCrossing);
    }

    #[test]
    fn test_camera_timestamp_preferred() {
        let received = Utc::now();
        let event = classifier(&[], None).classify(&crossing("Street"), received);
        assert_eq!(event.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(event.timestamp_source, TimestampSource::Camera);
        assert!(event.replay_key().is_some());
    }

    #[test]
    fn test_receipt_time_fallback() {
        let received = Utc.timestamp_opt(1_650_000_000, 0).unwrap();
        let f = frame(&[("Code", "CrossLineDetection"), ("action", "Start")]);
        let event = classifier(&[], None).classify(&f, received);
        assert_eq!(event.kind, EventKind::TrafficCrossing);
        assert_eq!(event.timestamp, received);
        assert!(event.replay_key().is_none());
    }

    #[test]
    fn test_top_level_name_field() {
        let f = frame(&[
            ("Code", "CrossLineDetection"),
            ("action", "Start"),
            ("name", "Street"),
        ]);
        let event = classifier(&["Street"], None).classify(&f, Utc::now());
        assert_eq!(event.kind, EventKind::TrafficCrossing);
    }

    #[test]
    fn test_serializes_inline_media_as_length() {
        let event = classifier(&[], Some("Garden")).classify(&intrusion("Garden"), Utc::now());
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "intrusion");
        assert_eq!(json["media"]["type"], "inline");
        assert_eq!(json["media"]["value"], 2);
    }
}
