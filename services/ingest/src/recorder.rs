//! Persists delivered events: one JSON line per event, snapshots as files.

use crate::classifier::{DomainEvent, EventKind, MediaRef};
use crate::config::SinkConfig;
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Writes events drained from the sink channel to disk.
pub struct EventRecorder {
    events_path: PathBuf,
    snapshot_dir: PathBuf,
    recorded: u64,
}

impl EventRecorder {
    pub fn new(config: &SinkConfig) -> Self {
        Self {
            events_path: PathBuf::from(&config.events_path),
            snapshot_dir: PathBuf::from(&config.snapshot_dir),
            recorded: 0,
        }
    }

    /// Drain the channel until every sender is gone.
    pub async fn run(mut self, mut events: mpsc::Receiver<DomainEvent>) -> u64 {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.record(event).await {
                error!(error = %e, path = %self.events_path.display(), "Failed to record event");
            }
        }
        info!(recorded = self.recorded, "Event recorder stopped");
        self.recorded
    }

    /// Record a single event, moving an inline snapshot to its own file.
    pub async fn record(&mut self, mut event: DomainEvent) -> Result<DomainEvent, RecorderError> {
        if let Some(MediaRef::Inline(bytes)) = &event.media {
            let path = self.snapshot_dir.join(snapshot_name(&event));
            fs::create_dir_all(&self.snapshot_dir).await?;
            fs::write(&path, bytes).await?;
            debug!(path = %path.display(), bytes = bytes.len(), "Snapshot written");
            event.media = Some(MediaRef::File(path));
        }

        if let Some(parent) = self.events_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        self.recorded += 1;
        if event.kind == EventKind::Intrusion {
            info!(rule = %event.rule_name, timestamp = %event.timestamp, "Intrusion recorded");
        }
        Ok(event)
    }
}

fn snapshot_name(event: &DomainEvent) -> String {
    let rule: String = event
        .rule_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}.jpg", event.timestamp.format("%Y%m%d%H%M%S"), rule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::TimestampSource;
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    fn config(dir: &std::path::Path) -> SinkConfig {
        SinkConfig {
            channel_capacity: 8,
            events_path: dir.join("out/events.jsonl").display().to_string(),
            snapshot_dir: dir.join("snaps").display().to_string(),
        }
    }

    fn event(kind: EventKind, media: Option<MediaRef>) -> DomainEvent {
        DomainEvent {
            kind,
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            timestamp_source: TimestampSource::Camera,
            code: "CrossRegionDetection".to_string(),
            rule_name: "Back Garden".to_string(),
            direction: None,
            index: Some(1),
            media,
        }
    }

    #[tokio::test]
    async fn test_snapshot_moved_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = EventRecorder::new(&config(dir.path()));

        let recorded = recorder
            .record(event(
                EventKind::Intrusion,
                Some(MediaRef::Inline(Bytes::from_static(b"jpeg"))),
            ))
            .await
            .unwrap();

        let expected = dir.path().join("snaps/20240501123000_Back_Garden.jpg");
        assert_eq!(recorded.media, Some(MediaRef::File(expected.clone())));
        assert_eq!(std::fs::read(expected).unwrap(), b"jpeg");
    }

    #[tokio::test]
    async fn test_run_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let (tx, rx) = mpsc::channel(8);

        tx.send(event(EventKind::TrafficCrossing, None)).await.unwrap();
        tx.send(event(EventKind::TrafficCrossing, None)).await.unwrap();
        drop(tx);

        let recorded = EventRecorder::new(&cfg).run(rx).await;
        assert_eq!(recorded, 2);

        let contents = std::fs::read_to_string(&cfg.events_path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "traffic_crossing");
        assert_eq!(first["rule_name"], "Back Garden");
    }
}
