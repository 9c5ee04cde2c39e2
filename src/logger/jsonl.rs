//! Append-only JSONL logging sink (spec §4.13). One JSON object per line:
//! `{"ts": "...", "level": "...", "msg": "...", ...fields}`.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

/// Log severity, ordered least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// One structured log line.
#[derive(Debug, Serialize)]
struct LogLine<'a> {
    ts: String,
    level: &'static str,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    fields: serde_json::Map<String, serde_json::Value>,
}

/// JSONL append-only logger. Falls back to stderr if the log file can't
/// be opened or a write fails, rather than treating logging as fatal to
/// the daemon (spec §9 "logging must never be on the critical path of
/// daemon liveness").
pub struct JsonlLogger {
    file: Mutex<Option<File>>,
    min_level: LogLevel,
}

impl JsonlLogger {
    /// Open (append mode, creating if absent) the JSONL file at `path`.
    /// Never fails: if the file can't be opened, subsequent log calls
    /// degrade to stderr.
    #[must_use]
    pub fn open(path: &Path, min_level: LogLevel) -> Self {
        let file = OpenOptions::new().create(true).append(true).open(path).ok();
        Self {
            file: Mutex::new(file),
            min_level,
        }
    }

    /// A logger that always writes to stderr, used before the state
    /// directory (and therefore the log file path) is known, or by tests.
    #[must_use]
    pub fn stderr_only(min_level: LogLevel) -> Self {
        Self {
            file: Mutex::new(None),
            min_level,
        }
    }

    /// Emit one structured log line. Silently dropped if `level` is below
    /// `min_level`.
    pub fn log(&self, level: LogLevel, msg: &str, code: Option<&str>, fields: serde_json::Map<String, serde_json::Value>) {
        if level < self.min_level {
            return;
        }
        let line = LogLine {
            ts: now_rfc3339(),
            level: level.as_str(),
            msg,
            code,
            fields,
        };
        let Ok(serialized) = serde_json::to_string(&line) else {
            eprintln!("{} {} {msg}", level.as_str(), line.ts);
            return;
        };
        let mut guard = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        match guard.as_mut() {
            Some(f) if writeln!(f, "{serialized}").is_ok() => {}
            _ => eprintln!("{serialized}"),
        }
    }

    pub fn debug(&self, msg: &str) {
        self.log(LogLevel::Debug, msg, None, serde_json::Map::new());
    }
    pub fn info(&self, msg: &str) {
        self.log(LogLevel::Info, msg, None, serde_json::Map::new());
    }
    pub fn warn(&self, msg: &str) {
        self.log(LogLevel::Warn, msg, None, serde_json::Map::new());
    }

    /// Log an error with its stable `KD-NNNN` code attached.
    pub fn error_code(&self, msg: &str, code: &str) {
        self.log(LogLevel::Error, msg, Some(code), serde_json::Map::new());
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Default JSONL log path under a state directory.
#[must_use]
pub fn default_log_path(state_dir: &Path) -> PathBuf {
    state_dir.join("keydeckd.log.jsonl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_one_line_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = JsonlLogger::open(&path, LogLevel::Debug);
        logger.info("daemon started");
        logger.warn("device reconnecting");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
        assert!(contents.contains("\"level\":\"info\""));
    }

    #[test]
    fn below_min_level_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = JsonlLogger::open(&path, LogLevel::Warn);
        logger.info("ignored");
        logger.warn("kept");
        let contents = std::fs::read_to_string(&path).unwrap_or_default();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn error_code_is_included() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.jsonl");
        let logger = JsonlLogger::open(&path, LogLevel::Debug);
        logger.error_code("config parse failed", "KD-1003");
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("KD-1003"));
    }
}
