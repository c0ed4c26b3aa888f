/// Activity Tracker
///
/// The control plane rewrites a timestamp file on every playlist fetch; the
/// scheduler reads it each tick to decide whether anyone is still watching.
/// Last write wins — there is no locking, a torn read simply fails parsing
/// and counts as "no update".
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ActivityError {
    #[error("activity file unreadable: {0}")]
    Io(#[from] std::io::Error),
    #[error("activity timestamp unparsable: {0}")]
    Parse(#[from] chrono::ParseError),
}

pub struct ActivityTracker {
    path: PathBuf,
}

impl ActivityTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Write a timestamp `grace_s` seconds in the future so the program does
    /// not pause before the first client ever connects.
    pub fn seed_startup_grace(&self, grace_s: i64) -> Result<(), ActivityError> {
        self.write(Utc::now() + Duration::seconds(grace_s))
    }

    /// Record activity "now". Exposed for collaborators embedding the crate;
    /// the scheduler itself only reads.
    pub fn record_activity(&self) -> Result<(), ActivityError> {
        self.write(Utc::now())
    }

    /// Whole seconds since the last recorded activity. Negative while the
    /// startup grace timestamp is still in the future.
    pub fn seconds_since_activity(&self) -> Result<i64, ActivityError> {
        let raw = std::fs::read_to_string(&self.path)?;
        let last: DateTime<Utc> = raw.trim().parse()?;
        Ok((Utc::now() - last).num_seconds())
    }

    fn write(&self, at: DateTime<Utc>) -> Result<(), ActivityError> {
        std::fs::write(&self.path, at.to_rfc3339())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_in(dir: &tempfile::TempDir) -> ActivityTracker {
        ActivityTracker::new(dir.path().join("last-activity.txt"))
    }

    #[test]
    fn fresh_activity_reads_near_zero() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir);
        tracker.record_activity().unwrap();
        let s = tracker.seconds_since_activity().unwrap();
        assert!((0..=1).contains(&s), "expected ~0 seconds, got {s}");
    }

    #[test]
    fn startup_grace_yields_negative_elapsed() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir);
        tracker.seed_startup_grace(30).unwrap();
        let s = tracker.seconds_since_activity().unwrap();
        assert!(s < 0, "grace timestamp lies in the future, got {s}");
    }

    #[test]
    fn stale_timestamp_measures_elapsed_time() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir);
        let old = Utc::now() - Duration::seconds(120);
        std::fs::write(dir.path().join("last-activity.txt"), old.to_rfc3339()).unwrap();
        let s = tracker.seconds_since_activity().unwrap();
        assert!((119..=121).contains(&s), "expected ~120 seconds, got {s}");
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let tracker = tracker_in(&dir);
        assert!(matches!(tracker.seconds_since_activity(), Err(ActivityError::Io(_))));
    }

    #[test]
    fn garbage_timestamp_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("last-activity.txt"), "yesterday-ish").unwrap();
        let tracker = tracker_in(&dir);
        assert!(matches!(tracker.seconds_since_activity(), Err(ActivityError::Parse(_))));
    }
}
