//! Append-only JSONL session event log.
//!
//! Every record carries `type`, `sessionId`, and `timestamp`; kind-specific
//! fields are merged in at the top level:
//!
//! ```text
//! {"type":"session.start","sessionId":"...","timestamp":1712345678901}
//! {"type":"tts.chunk","sessionId":"...","timestamp":...,"speaker":"host","bytes":1920}
//! ```

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

use crate::ports::{EventLogPort, LogEvent};

/// JSONL writer rooted at `<root>/<episode_id>/events.jsonl`.
pub struct JsonlEventLog {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
}

impl JsonlEventLog {
    pub fn new(root: impl Into<PathBuf>, episode_id: &str) -> Self {
        Self {
            path: root.into().join(episode_id).join("events.jsonl"),
            writer: None,
        }
    }

    /// Path of the log file.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl EventLogPort for JsonlEventLog {
    fn start(&mut self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating log dir {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        self.writer = Some(BufWriter::new(file));
        Ok(())
    }

    fn log(&mut self, event: LogEvent) -> Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            anyhow::bail!("event log not started");
        };

        let mut record = Map::new();
        record.insert("type".into(), Value::String(event.kind));
        record.insert("sessionId".into(), Value::String(event.session_id));
        record.insert("timestamp".into(), Value::from(event.timestamp_ms));
        if let Value::Object(data) = event.data {
            for (key, value) in data {
                record.insert(key, value);
            }
        }

        writeln!(writer, "{}", Value::Object(record))?;
        // Flush per record: the log must survive an abrupt disconnect.
        writer.flush()?;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Event log used when recording is disabled.
#[derive(Debug, Default)]
pub struct NullEventLog;

impl EventLogPort for NullEventLog {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn log(&mut self, _event: LogEvent) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_merged_jsonl_records() {
        let root = std::env::temp_dir().join(format!("greenroom-log-{}", uuid::Uuid::new_v4()));
        let mut log = JsonlEventLog::new(&root, "ep-1");
        log.start().unwrap();

        log.log(LogEvent::new("session.start", "s-1")).unwrap();
        log.log(LogEvent::new("tts.chunk", "s-1").with(json!({"speaker": "host", "bytes": 1920})))
            .unwrap();
        log.stop().unwrap();

        let content = fs::read_to_string(root.join("ep-1/events.jsonl")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["type"], "session.start");
        assert_eq!(first["sessionId"], "s-1");
        assert!(first["timestamp"].as_u64().unwrap() > 0);

        let second: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["type"], "tts.chunk");
        assert_eq!(second["speaker"], "host");
        assert_eq!(second["bytes"], 1920);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn logging_before_start_is_an_error() {
        let root = std::env::temp_dir().join(format!("greenroom-log-{}", uuid::Uuid::new_v4()));
        let mut log = JsonlEventLog::new(&root, "ep-2");
        assert!(log.log(LogEvent::new("session.start", "s-1")).is_err());
    }

    #[test]
    fn null_log_accepts_everything() {
        let mut log = NullEventLog;
        log.start().unwrap();
        log.log(LogEvent::new("anything", "s")).unwrap();
        log.stop().unwrap();
    }
}
