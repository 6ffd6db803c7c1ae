//! Append-only, per-day audit log of codes that failed vocabulary lookup.
//!
//! Unknown codes are a high-volume, benign anomaly: they are never surfaced on the
//! console or as errors. Each one is appended to
//! `{dir}/{YYYY-MM-DD}_numericalize_exceptions.log` for offline data-quality review,
//! and counted in memory.

use chrono::Local;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

const FILE_SUFFIX: &str = "numericalize_exceptions.log";

#[derive(Debug, Default)]
pub struct ExceptionLog {
    dir: Option<PathBuf>,
    recorded: AtomicUsize,
    write_lock: Mutex<()>,
}

impl ExceptionLog {
    /// A log that only counts; nothing is written to disk.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A log writing daily files below `dir` (created on first write).
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Path of today's log file, if file logging is enabled.
    pub fn current_file(&self) -> Option<PathBuf> {
        let today = Local::now().format("%Y-%m-%d");
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{today}_{FILE_SUFFIX}")))
    }

    /// Number of unknown codes recorded through this log.
    pub fn recorded(&self) -> usize {
        self.recorded.load(Ordering::Relaxed)
    }

    /// Records one unknown code. `source` names the vocabulary that rejected it.
    ///
    /// Never fails: an unwritable log directory is reported through `log::warn!` and the
    /// event is still counted.
    pub fn record(&self, source: &str, code: &str) {
        self.recorded.fetch_add(1, Ordering::Relaxed);

        let Some(path) = self.current_file() else {
            return;
        };
        let line = format!(
            "{} code in {source}: {code}\n",
            Local::now().format("%Y-%m-%dT%H:%M:%S%.3f")
        );

        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let result = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| OpenOptions::new().create(true).append(true).open(&path))
            .and_then(|mut file| file.write_all(line.as_bytes()));
        if let Err(e) = result {
            log::warn!(
                "Could not append to exception log '{}': {e}",
                path.display()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_log_still_counts() {
        let log = ExceptionLog::disabled();
        log.record("EhrVocab", "C");
        log.record("EhrVocab", "D");
        assert_eq!(log.recorded(), 2);
        assert!(log.current_file().is_none());
    }

    #[test]
    fn writes_one_line_per_unknown_code() {
        let dir = tempfile::tempdir().unwrap();
        let log = ExceptionLog::in_dir(dir.path().join("logs"));
        log.record("EhrVocab", "C");

        let contents = fs::read_to_string(log.current_file().unwrap()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with("code in EhrVocab: C"));
    }
}
