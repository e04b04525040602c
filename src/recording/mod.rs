//! Built-in recording adapters: raw PCM tracks plus a captions sidecar.
//!
//! Layout under the configured recording root:
//!
//! ```text
//! <root>/<episode_id>/
//!   human.pcm          16-bit LE mono PCM, one file per speaker
//!   host.pcm
//!   guest.pcm
//!   captions.jsonl     {"speaker","text","timestamp"} per line
//!   events.jsonl       append-only event log (see event_log module)
//! ```

pub mod event_log;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::json;

use crate::ports::RecorderPort;
use crate::session::SpeakerId;

// ── PCM recorder ───────────────────────────────────────────────────

/// Writes one raw PCM track per speaker and a captions JSONL sidecar.
/// Track files are created lazily on the first audio for a speaker.
pub struct PcmRecorder {
    dir: PathBuf,
    tracks: HashMap<SpeakerId, BufWriter<File>>,
    captions: Option<BufWriter<File>>,
    files: Vec<PathBuf>,
    started: bool,
}

impl PcmRecorder {
    pub fn new(root: impl Into<PathBuf>, episode_id: &str) -> Self {
        Self {
            dir: root.into().join(episode_id),
            tracks: HashMap::new(),
            captions: None,
            files: Vec::new(),
            started: false,
        }
    }

    fn track(&mut self, speaker: SpeakerId) -> Result<&mut BufWriter<File>> {
        if !self.tracks.contains_key(&speaker) {
            let path = self.dir.join(format!("{speaker}.pcm"));
            let file = File::create(&path)
                .with_context(|| format!("creating track {}", path.display()))?;
            self.files.push(path);
            self.tracks.insert(speaker, BufWriter::new(file));
        }
        Ok(self.tracks.get_mut(&speaker).expect("inserted above"))
    }
}

impl RecorderPort for PcmRecorder {
    fn start(&mut self) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating recording dir {}", self.dir.display()))?;
        self.started = true;
        tracing::debug!(dir = %self.dir.display(), "recorder started");
        Ok(())
    }

    fn write_audio(&mut self, speaker: SpeakerId, pcm: &[u8]) -> Result<()> {
        if !self.started || pcm.is_empty() {
            return Ok(());
        }
        self.track(speaker)?.write_all(pcm)?;
        Ok(())
    }

    fn add_caption(&mut self, speaker: SpeakerId, text: &str) -> Result<()> {
        if !self.started {
            return Ok(());
        }
        if self.captions.is_none() {
            let path = self.dir.join("captions.jsonl");
            let file = File::create(&path)
                .with_context(|| format!("creating captions {}", path.display()))?;
            self.files.push(path);
            self.captions = Some(BufWriter::new(file));
        }
        let line = json!({
            "speaker": speaker,
            "text": text,
            "timestamp": chrono::Utc::now().timestamp_millis(),
        });
        let writer = self.captions.as_mut().expect("created above");
        writeln!(writer, "{line}")?;
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<PathBuf>> {
        for writer in self.tracks.values_mut() {
            writer.flush()?;
        }
        if let Some(captions) = self.captions.as_mut() {
            captions.flush()?;
        }
        self.tracks.clear();
        self.captions = None;
        self.started = false;
        Ok(std::mem::take(&mut self.files))
    }
}

// ── Disabled recorder ──────────────────────────────────────────────

/// Recorder used when recording is disabled: accepts everything, writes
/// nothing.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl RecorderPort for NullRecorder {
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn write_audio(&mut self, _speaker: SpeakerId, _pcm: &[u8]) -> Result<()> {
        Ok(())
    }

    fn add_caption(&mut self, _speaker: SpeakerId, _text: &str) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_root() -> PathBuf {
        std::env::temp_dir().join(format!("greenroom-rec-{}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn records_tracks_and_captions() {
        let root = temp_root();
        let mut recorder = PcmRecorder::new(&root, "ep-1");
        recorder.start().unwrap();

        recorder.write_audio(SpeakerId::Human, &[1, 2, 3, 4]).unwrap();
        recorder.write_audio(SpeakerId::Host, &[5, 6]).unwrap();
        recorder.write_audio(SpeakerId::Human, &[7, 8]).unwrap();
        recorder.add_caption(SpeakerId::Human, "hello there").unwrap();

        let files = recorder.stop().unwrap();
        assert_eq!(files.len(), 3); // human.pcm, host.pcm, captions.jsonl

        let human = fs::read(root.join("ep-1/human.pcm")).unwrap();
        assert_eq!(human, vec![1, 2, 3, 4, 7, 8]);

        let captions = fs::read_to_string(root.join("ep-1/captions.jsonl")).unwrap();
        assert!(captions.contains("hello there"));
        assert!(captions.contains("\"human\""));

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn stop_without_media_returns_no_files() {
        let root = temp_root();
        let mut recorder = PcmRecorder::new(&root, "ep-2");
        recorder.start().unwrap();
        let files = recorder.stop().unwrap();
        assert!(files.is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn writes_before_start_are_dropped() {
        let root = temp_root();
        let mut recorder = PcmRecorder::new(&root, "ep-3");
        recorder.write_audio(SpeakerId::Human, &[1, 2]).unwrap();
        recorder.start().unwrap();
        let files = recorder.stop().unwrap();
        assert!(files.is_empty());
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn null_recorder_is_inert() {
        let mut recorder = NullRecorder;
        recorder.start().unwrap();
        recorder.write_audio(SpeakerId::Guest, &[1, 2]).unwrap();
        recorder.add_caption(SpeakerId::Guest, "x").unwrap();
        assert!(recorder.stop().unwrap().is_empty());
    }
}
