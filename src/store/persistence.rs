//! Day-window persistence
//!
//! Each source writes `<YYYY-MM-DD>_<tag>.json` files holding
//! `{"entries": [...]}`. The date embedded in the file name drives both
//! the dedup rebuild and the retention sweep; file modification times
//! are never consulted.
//!
//! `append` is read-modify-write and NOT safe for concurrent writers on
//! the same window. The collector runs one tick at a time per source,
//! which is the only serialization this relies on.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::schema::CanonicalRecord;

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("window file {path} is corrupted: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    #[error("failed to serialize window: {0}")]
    Serialize(#[from] serde_json::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct WindowFile {
    #[serde(default)]
    entries: Vec<CanonicalRecord>,
}

/// Log files swept together with the data windows.
#[derive(Debug, Clone)]
pub struct LogArtifacts {
    pub dir: PathBuf,
    /// Files are named `<prefix>_<YYYY-MM-DD>.log`
    pub prefix: String,
}

/// Day-window storage for one source.
#[derive(Debug, Clone)]
pub struct DayStore {
    dir: PathBuf,
    tag: String,
    logs: Option<LogArtifacts>,
}

impl DayStore {
    pub fn new(dir: impl Into<PathBuf>, tag: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            tag: tag.into(),
            logs: None,
        }
    }

    pub fn with_logs(mut self, logs: LogArtifacts) -> Self {
        self.logs = Some(logs);
        self
    }

    pub fn window_path(&self, date: NaiveDate) -> PathBuf {
        self.dir
            .join(format!("{}_{}.json", date.format(DATE_FORMAT), self.tag))
    }

    /// Date embedded in one of this store's file names.
    ///
    /// Matches `<date>_<tag>.json` and its quarantined variants
    /// (`<date>_<tag>.json.corrupt-...`).
    fn window_date(&self, file_name: &str) -> Option<NaiveDate> {
        let (date, rest) = file_name.split_once('_')?;
        let rest = rest.strip_prefix(self.tag.as_str())?;
        if !rest.starts_with(".json") {
            return None;
        }
        NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
    }

    /// Loads every record persisted for `date`.
    ///
    /// A missing or empty file is an empty window.
    pub fn load_window(&self, date: NaiveDate) -> Result<Vec<CanonicalRecord>, StoreError> {
        let path = self.window_path(date);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&path)(e)),
        };

        if content.trim().is_empty() {
            warn!("Window file {} is empty", path.display());
            return Ok(Vec::new());
        }

        let window: WindowFile =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupted {
                path: path.clone(),
                reason: e.to_string(),
            })?;

        Ok(window.entries)
    }

    /// Appends `records` to the window for `date` and returns the window size.
    ///
    /// Loads the existing window, concatenates and writes the union back
    /// through a temp file + rename. A corrupted window is quarantined
    /// first instead of being overwritten.
    pub fn append(&self, date: NaiveDate, records: &[CanonicalRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }

        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let mut entries = match self.load_window(date) {
            Ok(entries) => entries,
            Err(StoreError::Corrupted { path, reason }) => {
                self.quarantine(&path, &reason)?;
                Vec::new()
            }
            Err(e) => return Err(e),
        };
        entries.extend_from_slice(records);
        let total = entries.len();

        let path = self.window_path(date);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(&WindowFile { entries })?;

        fs::write(&tmp, content).map_err(io_error(&tmp))?;
        fs::rename(&tmp, &path).map_err(io_error(&path))?;

        info!(
            "Saved {} new entries to {} ({} total)",
            records.len(),
            path.display(),
            total
        );
        Ok(total)
    }

    fn quarantine(&self, path: &Path, reason: &str) -> Result<(), StoreError> {
        let stamp = Local::now().format("%H%M%S");
        let target = PathBuf::from(format!("{}.corrupt-{}", path.display(), stamp));
        fs::rename(path, &target).map_err(io_error(path))?;
        warn!(
            "Quarantined corrupted window {} as {} ({})",
            path.display(),
            target.display(),
            reason
        );
        Ok(())
    }

    /// Dates of every live window file of this store, ascending.
    pub fn windows(&self) -> Result<Vec<NaiveDate>, StoreError> {
        let mut dates: Vec<NaiveDate> = self
            .list(&self.dir)?
            .into_iter()
            .filter(|name| name.ends_with(".json"))
            .filter_map(|name| self.window_date(&name))
            .collect();
        dates.sort();
        dates.dedup();
        Ok(dates)
    }

    fn list(&self, dir: &Path) -> Result<Vec<String>, StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(dir)(e)),
        };

        Ok(entries
            .filter_map(Result::ok)
            .filter_map(|e| e.file_name().into_string().ok())
            .collect())
    }

    /// Removes windows (and log files) dated strictly before `before`.
    ///
    /// Returns the removed paths.
    pub fn prune(&self, before: NaiveDate) -> Result<Vec<PathBuf>, StoreError> {
        let mut removed = Vec::new();

        for name in self.list(&self.dir)? {
            if self.window_date(&name).is_some_and(|d| d < before) {
                removed.push(self.dir.join(name));
            }
        }

        if let Some(logs) = &self.logs {
            for name in self.list(&logs.dir)? {
                if log_file_date(&name, &logs.prefix).is_some_and(|d| d < before) {
                    removed.push(logs.dir.join(name));
                }
            }
        }

        for path in &removed {
            match fs::remove_file(path) {
                Ok(()) => info!("Removed outdated file: {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(io_error(path)(e)),
            }
        }

        Ok(removed)
    }
}

/// Date of a `<prefix>_<YYYY-MM-DD>.log` file.
pub fn log_file_date(file_name: &str, prefix: &str) -> Option<NaiveDate> {
    let date = file_name
        .strip_prefix(prefix)?
        .strip_prefix('_')?
        .strip_suffix(".log")?;
    NaiveDate::parse_from_str(date, DATE_FORMAT).ok()
}

/// Name of the log file for `date`.
pub fn log_file_name(prefix: &str, date: NaiveDate) -> String {
    format!("{}_{}.log", prefix, date.format(DATE_FORMAT))
}
