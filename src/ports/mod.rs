//! External adapter ports.
//!
//! The core consumes speech services, the recorder, and the event log
//! through these narrow interfaces; concrete backends live outside the core
//! and are referenced, never owned, by a session. Results flow back by the
//! adapter invoking the orchestrator's inbound methods
//! (`on_transcript`, `on_tts_chunk`, `on_tts_complete`, `on_tts_error`).
//!
//! A failed adapter warm-up is not fatal: the handle is simply absent and
//! the affected agent has no voice output until recovery.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::session::SpeakerId;

// ── Speech-to-text ─────────────────────────────────────────────────

/// Streaming transcription service for the human microphone.
#[async_trait]
pub trait SttPort: Send + Sync {
    /// Begin a transcription stream for a session.
    async fn start(&self, session_id: &str) -> anyhow::Result<()>;

    /// Forward a PCM16LE chunk to the recognizer.
    async fn send_audio(&self, session_id: &str, pcm: &[u8]) -> anyhow::Result<()>;

    /// Tear down the stream.
    async fn stop(&self, session_id: &str) -> anyhow::Result<()>;
}

// ── Text-to-speech ─────────────────────────────────────────────────

/// Speech synthesis for one agent voice. Audio chunks stream back through
/// the orchestrator's inbound methods; `stop` is a cooperative request — an
/// agent that does not honor it is considered stopped once its completion
/// callback arrives.
#[async_trait]
pub trait TtsPort: Send + Sync {
    async fn synthesize(&self, session_id: &str, text: &str) -> anyhow::Result<()>;

    async fn stop(&self, session_id: &str) -> anyhow::Result<()>;
}

// ── Recorder ───────────────────────────────────────────────────────

/// Per-session media recorder. Container format is the implementation's
/// contract and opaque to the core.
pub trait RecorderPort: Send + Sync {
    fn start(&mut self) -> anyhow::Result<()>;

    fn write_audio(&mut self, speaker: SpeakerId, pcm: &[u8]) -> anyhow::Result<()>;

    fn add_caption(&mut self, speaker: SpeakerId, text: &str) -> anyhow::Result<()>;

    /// Finish writing and return the produced files.
    fn stop(&mut self) -> anyhow::Result<Vec<PathBuf>>;
}

// ── Event log ──────────────────────────────────────────────────────

/// One append-only event record.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Event kind, e.g. `session.start`, `tts.chunk`, `barge-in.cancelled`.
    pub kind: String,
    pub session_id: String,
    /// Epoch milliseconds.
    pub timestamp_ms: u64,
    /// Kind-specific fields, merged into the record at the top level.
    pub data: Value,
}

impl LogEvent {
    pub fn new(kind: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            session_id: session_id.into(),
            timestamp_ms: chrono::Utc::now().timestamp_millis() as u64,
            data: Value::Null,
        }
    }

    /// Attach kind-specific fields (must serialize to a JSON object).
    pub fn with(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Append-only session event log.
pub trait EventLogPort: Send + Sync {
    fn start(&mut self) -> anyhow::Result<()>;

    fn log(&mut self, event: LogEvent) -> anyhow::Result<()>;

    fn stop(&mut self) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn log_event_builder() {
        let event = LogEvent::new("tts.chunk", "s-1").with(json!({"bytes": 960}));
        assert_eq!(event.kind, "tts.chunk");
        assert_eq!(event.session_id, "s-1");
        assert!(event.timestamp_ms > 0);
        assert_eq!(event.data["bytes"], 960);
    }
}
