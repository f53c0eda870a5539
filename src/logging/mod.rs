//! Per-engine log files.
//!
//! Every engine owns a pair of JSON-line loggers bound to append-only files
//! under its log directory: `server.log` for activity and `error.log` for
//! failures. The handles are cheap to clone and internally synchronized, so
//! connection tasks can log without coordination.

use chrono::{SecondsFormat, Utc};
use serde_json::json;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info};

pub const SERVER_LOG_FILE: &str = "server.log";
pub const ERROR_LOG_FILE: &str = "error.log";

struct JsonLogger {
    file: Mutex<File>,
}

impl JsonLogger {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }

    fn write(&self, level: &str, msg: &str) {
        let record = json!({
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "level": level,
            "msg": msg,
        });
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = writeln!(file, "{record}");
    }
}

/// The activity/error logger pair for one engine instance.
#[derive(Clone)]
pub struct EngineLogs {
    inner: Arc<Inner>,
}

struct Inner {
    server: JsonLogger,
    error: JsonLogger,
}

impl EngineLogs {
    /// Open (creating if needed) `server.log` and `error.log` under the
    /// given log directory.
    pub fn open(log_root: &Path) -> io::Result<Self> {
        let server = JsonLogger::open(&log_root.join(SERVER_LOG_FILE))?;
        let error = JsonLogger::open(&log_root.join(ERROR_LOG_FILE))?;
        Ok(Self {
            inner: Arc::new(Inner { server, error }),
        })
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        info!("{msg}");
        self.inner.server.write("INFO", msg);
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        let msg = msg.as_ref();
        error!("{msg}");
        self.inner.error.write("ERROR", msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn writes_json_lines() {
        let dir = TempDir::new().unwrap();
        let logs = EngineLogs::open(dir.path()).unwrap();

        logs.info("server started");
        logs.error("something broke");

        let server = std::fs::read_to_string(dir.path().join(SERVER_LOG_FILE)).unwrap();
        let error = std::fs::read_to_string(dir.path().join(ERROR_LOG_FILE)).unwrap();

        let record: serde_json::Value = serde_json::from_str(server.lines().next().unwrap()).unwrap();
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["msg"], "server started");
        assert!(record["time"].is_string());

        let record: serde_json::Value = serde_json::from_str(error.lines().next().unwrap()).unwrap();
        assert_eq!(record["level"], "ERROR");
        assert_eq!(record["msg"], "something broke");
    }

    #[test]
    fn appends_to_existing_log() {
        let dir = TempDir::new().unwrap();
        {
            let logs = EngineLogs::open(dir.path()).unwrap();
            logs.info("first");
        }
        {
            let logs = EngineLogs::open(dir.path()).unwrap();
            logs.info("second");
        }
        let server = std::fs::read_to_string(dir.path().join(SERVER_LOG_FILE)).unwrap();
        assert_eq!(server.lines().count(), 2);
    }
}
