//! Disk retention: periodically deletes segment files older than the
//! configured age. The start timestamp is parsed straight out of the file
//! name, which is the segment's single source of temporal truth.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use tracing::{debug, warn};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);

pub fn spawn(segment_dir: PathBuf, retention: Duration) -> Result<()> {
    thread::Builder::new()
        .name("retention".into())
        .spawn(move || loop {
            thread::sleep(SWEEP_INTERVAL);
            let cutoff = camgate_util::time::now_ms() - retention.as_millis() as i64;
            if let Err(e) = sweep(&segment_dir, cutoff) {
                warn!(%e, "segment cleanup pass failed");
            }
        })
        .context("failed to spawn retention scheduler")?;
    Ok(())
}

/// Deletes every segment file whose start timestamp is before `cutoff_ms`.
/// Files that do not match the segment name grammar are left alone.
fn sweep(dir: &Path, cutoff_ms: i64) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let Some(start_ts) = segment_start_ts(&entry.file_name()) else {
            continue;
        };
        if start_ts < cutoff_ms {
            match std::fs::remove_file(entry.path()) {
                Ok(()) => debug!(path = %entry.path().display(), "deleted expired segment"),
                Err(e) => warn!(%e, path = %entry.path().display(), "failed to delete segment"),
            }
        }
    }
    Ok(())
}

/// Parses `<start_ts>_<duration_ms>.<ext>`, returning the start timestamp.
fn segment_start_ts(name: &OsStr) -> Option<i64> {
    let name = name.to_str()?;
    let (stem, _ext) = name.rsplit_once('.')?;
    let (start_ts, duration) = stem.split_once('_')?;
    duration.parse::<i64>().ok()?;
    start_ts.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_name_parsing() {
        assert_eq!(
            segment_start_ts(OsStr::new("1700000000000_2000.mp4")),
            Some(1_700_000_000_000)
        );
        assert_eq!(segment_start_ts(OsStr::new("0_0.mp4")), Some(0));
        assert_eq!(segment_start_ts(OsStr::new("README.md")), None);
        assert_eq!(segment_start_ts(OsStr::new("1700_x.mp4")), None);
        assert_eq!(segment_start_ts(OsStr::new("17002000.mp4")), None);
        assert_eq!(segment_start_ts(OsStr::new("1700_2000")), None);
    }

    #[test]
    fn test_sweep_deletes_only_expired_segments() {
        let dir = tempfile::tempdir().unwrap();
        let now = camgate_util::time::now_ms();
        // segments started 10/30/70/120 s ago, 60 s retention
        for age_s in [10i64, 30, 70, 120] {
            let name = format!("{}_2000.mp4", now - age_s * 1000);
            std::fs::write(dir.path().join(name), b"segment").unwrap();
        }
        std::fs::write(dir.path().join("notes.txt"), b"keep me").unwrap();

        sweep(dir.path(), now - 60 * 1000).unwrap();

        let mut remaining: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        remaining.sort();
        assert_eq!(remaining.len(), 3);
        assert!(remaining.contains(&"notes.txt".to_owned()));
        assert!(remaining.contains(&format!("{}_2000.mp4", now - 10_000)));
        assert!(remaining.contains(&format!("{}_2000.mp4", now - 30_000)));
    }

    #[test]
    fn test_sweep_missing_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("gone");
        assert!(sweep(&missing, 0).is_err());
    }
}
