//! Matches events to the snapshots and recordings the camera uploads.
//!
//! The camera writes one directory per day. Snapshots are named
//! `001_YYYYMMDDHHmmss_[TYPE]...jpg`, recordings
//! `HH.MM.SS-HH.MM.SS[TYPE]...dav`. Timestamps are the camera's local time.

use crate::error::{MediaError, Result};
use crate::media_path::{validate_date, MediaRoot};
use chrono::{Duration, NaiveDate, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::io::ErrorKind;
use tokio::fs;
use tracing::{debug, warn};

/// Largest distance, in seconds, at which a file still belongs to an event
pub const MATCH_THRESHOLD_SECS: i64 = 30;

static JPG_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^\d+_(\d{14})_\[.*\].*\.jpg$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

static DAV_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r"^(\d{2})\.(\d{2})\.(\d{2})-(\d{2})\.(\d{2})\.(\d{2})\[.*\].*\.dav$")
        .case_insensitive(true)
        .build()
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub filename: String,
    pub taken_at: NaiveDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    pub filename: String,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Recording {
    fn contains(&self, at: NaiveDateTime) -> bool {
        self.start <= at && at <= self.end
    }

    fn midpoint(&self) -> NaiveDateTime {
        self.start + (self.end - self.start) / 2
    }
}

/// Media found for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MediaMatch {
    pub snapshot: Option<String>,
    pub video: Option<String>,
}

/// Timestamp encoded in a snapshot file name.
pub fn parse_snapshot_name(filename: &str) -> Option<NaiveDateTime> {
    let caps = JPG_RE.captures(filename)?;
    NaiveDateTime::parse_from_str(&caps[1], "%Y%m%d%H%M%S").ok()
}

/// Time range encoded in a recording file name. A range that wraps past
/// midnight ends on the following day.
pub fn parse_recording_name(filename: &str, date: NaiveDate) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let caps = DAV_RE.captures(filename)?;
    let field = |i: usize| caps[i].parse::<u32>().ok();

    let start = date.and_time(NaiveTime::from_hms_opt(field(1)?, field(2)?, field(3)?)?);
    let mut end = date.and_time(NaiveTime::from_hms_opt(field(4)?, field(5)?, field(6)?)?);
    if end < start {
        end += Duration::days(1);
    }
    Some((start, end))
}

/// Parsed contents of one day's upload directory.
#[derive(Debug, Clone, Default)]
pub struct DateDirectory {
    snapshots: Vec<Snapshot>,
    recordings: Vec<Recording>,
}

impl DateDirectory {
    /// Classify file names; anything that is neither kind is skipped.
    pub fn from_names<I, S>(date: NaiveDate, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut dir = Self::default();
        for name in names {
            let filename: String = name.into();
            if let Some(taken_at) = parse_snapshot_name(&filename) {
                dir.snapshots.push(Snapshot { filename, taken_at });
            } else if let Some((start, end)) = parse_recording_name(&filename, date) {
                dir.recordings.push(Recording {
                    filename,
                    start,
                    end,
                });
            }
        }
        dir.snapshots.sort_by_key(|s| s.taken_at);
        dir.recordings.sort_by_key(|r| r.start);
        dir
    }

    /// List `date` under the media root. A missing directory is empty.
    pub async fn scan(root: &MediaRoot, date: &str) -> Result<Self> {
        validate_date(date)?;
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d").map_err(|_| {
            MediaError::InvalidIdentifier(format!("bad date: {}", date))
        })?;

        let path = root.join(date)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(date = %date, "No media directory for date");
                return Ok(Self::default());
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to list media directory");
                return Err(e.into());
            }
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(Self::from_names(day, names))
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn recordings(&self) -> &[Recording] {
        &self.recordings
    }

    /// Closest snapshot and the recording covering `at`, both within
    /// [`MATCH_THRESHOLD_SECS`].
    pub fn match_event(&self, at: NaiveDateTime) -> MediaMatch {
        let threshold = Duration::seconds(MATCH_THRESHOLD_SECS);
        let snapshot = self
            .snapshots
            .iter()
            .map(|s| ((s.taken_at - at).abs(), s))
            .filter(|(dist, _)| *dist <= threshold)
            .min_by_key(|(dist, _)| *dist)
            .map(|(_, s)| s.filename.clone());

        let video = match self.recordings.iter().find(|r| r.contains(at)) {
            Some(r) => Some(r.filename.clone()),
            None => self
                .recordings
                .iter()
                .map(|r| ((r.midpoint() - at).abs(), r))
                .filter(|(dist, _)| *dist <= threshold)
                .min_by_key(|(dist, _)| *dist)
                .map(|(_, r)| r.filename.clone()),
        };

        MediaMatch { snapshot, video }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> NaiveDateTime {
        day().and_hms_opt(h, m, s).unwrap()
    }

    fn directory() -> DateDirectory {
        DateDirectory::from_names(
            day(),
            [
                "001_20240501120010_[M][0@0][0].jpg",
                "002_20240501120500_[M][0@0][0].JPG",
                "12.00.00-12.02.00[M][0@0][0].dav",
                "12.10.00-12.12.00[M][0@0][0].dav",
                "23.59.00-00.01.00[M][0@0][0].dav",
                "notes.txt",
            ],
        )
    }

    #[test]
    fn test_parse_names() {
        assert_eq!(
            parse_snapshot_name("001_20240501120010_[M][0@0][0].jpg"),
            Some(at(12, 0, 10))
        );
        assert_eq!(parse_snapshot_name("snapshot.jpg"), None);
        assert_eq!(parse_snapshot_name("001_20241301120010_[M].jpg"), None);

        assert_eq!(
            parse_recording_name("12.00.00-12.02.00[M][0@0][0].dav", day()),
            Some((at(12, 0, 0), at(12, 2, 0)))
        );
        assert_eq!(parse_recording_name("12.00.00[M].dav", day()), None);
    }

    #[test]
    fn test_recording_across_midnight() {
        let (start, end) = parse_recording_name("23.59.00-00.01.00[M].dav", day()).unwrap();
        assert_eq!(start, at(23, 59, 0));
        assert_eq!(end, NaiveDate::from_ymd_opt(2024, 5, 2).unwrap().and_hms_opt(0, 1, 0).unwrap());
    }

    #[test]
    fn test_from_names_classifies() {
        let dir = directory();
        assert_eq!(dir.snapshots().len(), 2);
        assert_eq!(dir.recordings().len(), 3);
    }

    #[test]
    fn test_match_inside_recording() {
        let found = directory().match_event(at(12, 0, 20));
        assert_eq!(found.snapshot.as_deref(), Some("001_20240501120010_[M][0@0][0].jpg"));
        assert_eq!(found.video.as_deref(), Some("12.00.00-12.02.00[M][0@0][0].dav"));
    }

    #[test]
    fn test_match_by_midpoint_within_threshold() {
        // 12:02:30 is outside both recordings; the first one's midpoint is
        // 90s away and the second one's 8.5 minutes, so neither matches.
        assert_eq!(directory().match_event(at(12, 2, 30)).video, None);

        let short = DateDirectory::from_names(day(), ["12.00.00-12.00.20[M].dav"]);
        let found = short.match_event(at(12, 0, 35));
        assert_eq!(found.video.as_deref(), Some("12.00.00-12.00.20[M].dav"));
    }

    #[test]
    fn test_no_match_beyond_threshold() {
        let found = directory().match_event(at(15, 0, 0));
        assert_eq!(found, MediaMatch::default());
    }

    #[test]
    fn test_scan_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let root = MediaRoot::new(dir.path()).unwrap();
        let scanned = tokio_test::block_on(DateDirectory::scan(&root, "2024-05-01")).unwrap();
        assert!(scanned.snapshots().is_empty());
        assert!(scanned.recordings().is_empty());
    }

    #[tokio::test]
    async fn test_scan_lists_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("2024-05-01")).unwrap();
        std::fs::write(dir.path().join("2024-05-01/12.00.00-12.02.00[M].dav"), b"").unwrap();
        let root = MediaRoot::new(dir.path()).unwrap();

        let scanned = DateDirectory::scan(&root, "2024-05-01").await.unwrap();
        assert_eq!(scanned.recordings().len(), 1);
        assert!(DateDirectory::scan(&root, "../etc").await.is_err());
    }
}
