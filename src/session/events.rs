//! WebSocket message schema for a studio session.
//!
//! All control messages are JSON text frames tagged with `type`; microphone
//! audio travels as raw binary frames (PCM16LE mono). Agent audio to the
//! client is base64 PCM inside JSON (upgrade to binary frames is a future
//! optimization).
//!
//! ```text
//! Browser mic ──binary──▸ greenroom ──▸ STT / LLM / TTS adapters
//!     ◂── orb.state / caption / audio.out / shared-screen.state ──◂
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Caption, OrbState, SharedScreen, SpeakerId};

// ── Client → Server ────────────────────────────────────────────────

/// JSON messages sent by the client. Microphone audio (`audio.chunk`)
/// arrives as binary frames, not through this enum.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First message after connect; all fields optional.
    #[serde(rename = "hello")]
    Hello {
        #[serde(rename = "episodeId", skip_serializing_if = "Option::is_none")]
        episode_id: Option<String>,
        #[serde(rename = "participantName", skip_serializing_if = "Option::is_none")]
        participant_name: Option<String>,
    },

    /// Toggle host-led autopilot mode.
    #[serde(rename = "client.toggle-autopilot")]
    ToggleAutopilot { enabled: bool },

    /// Ask for a fresh state snapshot.
    #[serde(rename = "client.request-state")]
    RequestState,
}

// ── Server → Client ────────────────────────────────────────────────

/// JSON messages sent to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A speaker's orb changed presentation state.
    #[serde(rename = "orb.state")]
    Orb { speaker: SpeakerId, state: OrbState },

    /// A finalized transcript line.
    #[serde(rename = "caption")]
    Caption(Caption),

    /// Thinking mode began for a speaker.
    #[serde(rename = "mode.thinking")]
    ModeThinking {
        speaker: SpeakerId,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        #[serde(rename = "startedAt")]
        started_at: u64,
    },

    /// Thinking mode ended.
    #[serde(rename = "mode.normal")]
    ModeNormal {
        speaker: SpeakerId,
        #[serde(rename = "endedAt")]
        ended_at: u64,
    },

    /// The shared screen changed.
    #[serde(rename = "shared-screen.state")]
    SharedScreenState { screen: SharedScreen },

    /// Agent audio chunk for playback.
    #[serde(rename = "audio.out")]
    AudioOut {
        speaker: SpeakerId,
        /// Per-speaker playback ordering.
        seq: u64,
        /// Base64-encoded PCM16LE audio.
        pcm16le: String,
    },

    /// Recording artifacts written at session end.
    #[serde(rename = "recording.ready")]
    RecordingReady {
        #[serde(rename = "episodeId")]
        episode_id: String,
        files: Vec<String>,
    },

    /// Free-form short acknowledgment.
    #[serde(rename = "server.ack")]
    Ack { message: String },

    /// Complete presentation state; enough to reconstruct the UI with no
    /// prior deltas.
    #[serde(rename = "state.snapshot")]
    Snapshot {
        #[serde(rename = "orbStates")]
        orb_states: HashMap<SpeakerId, OrbState>,
        /// Most recent captions, newest first, at most 6.
        captions: Vec<Caption>,
        autopilot: bool,
        #[serde(rename = "sharedScreen")]
        shared_screen: SharedScreen,
    },
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_message_round_trip() {
        let msg = ClientMessage::Hello {
            episode_id: Some("ep-042".into()),
            participant_name: Some("Basil".into()),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"hello\""));
        assert!(json.contains("episodeId"));
        match serde_json::from_str(&json).unwrap() {
            ClientMessage::Hello { episode_id, .. } => {
                assert_eq!(episode_id.as_deref(), Some("ep-042"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn toggle_autopilot_tag() {
        let json = serde_json::to_string(&ClientMessage::ToggleAutopilot { enabled: true }).unwrap();
        assert!(json.contains("client.toggle-autopilot"));
    }

    #[test]
    fn orb_state_message() {
        let msg = ServerMessage::Orb {
            speaker: SpeakerId::Host,
            state: OrbState::Speaking,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("orb.state"));
        assert!(json.contains("\"host\""));
        assert!(json.contains("\"speaking\""));
    }

    #[test]
    fn audio_out_message() {
        let msg = ServerMessage::AudioOut {
            speaker: SpeakerId::Guest,
            seq: 7,
            pcm16le: "AAAA".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("audio.out"));
        assert!(json.contains("pcm16le"));
    }

    #[test]
    fn snapshot_message_shape() {
        let mut orb_states = HashMap::new();
        orb_states.insert(SpeakerId::Human, OrbState::Listening);
        let msg = ServerMessage::Snapshot {
            orb_states,
            captions: vec![],
            autopilot: false,
            shared_screen: SharedScreen::Conversation,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("state.snapshot"));
        assert!(json.contains("orbStates"));
        assert!(json.contains("sharedScreen"));
    }

    #[test]
    fn mode_messages_use_camel_case_fields() {
        let json = serde_json::to_string(&ServerMessage::ModeThinking {
            speaker: SpeakerId::Host,
            duration_ms: 10_000,
            started_at: 5,
        })
        .unwrap();
        assert!(json.contains("mode.thinking"));
        assert!(json.contains("durationMs"));
        assert!(json.contains("startedAt"));

        let json = serde_json::to_string(&ServerMessage::ModeNormal {
            speaker: SpeakerId::Host,
            ended_at: 6,
        })
        .unwrap();
        assert!(json.contains("mode.normal"));
        assert!(json.contains("endedAt"));
    }
}
