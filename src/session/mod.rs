//! Session domain types shared across the floor-control engines, the
//! orchestrator, and the wire protocol.

pub mod events;
pub mod orchestrator;

use serde::{Deserialize, Serialize};

// ── Speakers ───────────────────────────────────────────────────────

/// A party in the three-way conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpeakerId {
    /// The human participant.
    Human,
    /// The primary ("host") agent.
    Host,
    /// The secondary ("guest") agent.
    Guest,
}

impl SpeakerId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }

    /// Whether this party is one of the two agents.
    pub fn is_agent(self) -> bool {
        matches!(self, Self::Host | Self::Guest)
    }

    /// The two agent speakers.
    pub fn agents() -> [SpeakerId; 2] {
        [Self::Host, Self::Guest]
    }

    /// Every speaker.
    pub fn all() -> [SpeakerId; 3] {
        [Self::Human, Self::Host, Self::Guest]
    }

    /// The agent that is not `self`. Meaningless for the human.
    pub fn other_agent(self) -> SpeakerId {
        match self {
            Self::Host => Self::Guest,
            _ => Self::Host,
        }
    }
}

impl std::fmt::Display for SpeakerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Orb presentation state ─────────────────────────────────────────

/// Per-speaker presentation state shown by the client UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrbState {
    Idle,
    Listening,
    Thinking,
    Speaking,
    Muted,
    Error,
}

// ── Captions ───────────────────────────────────────────────────────

/// A finalized transcript line attributed to a speaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Caption {
    /// Unique caption identifier.
    pub id: String,
    pub speaker: SpeakerId,
    pub text: String,
    /// Epoch milliseconds at finalization.
    #[serde(rename = "timestamp")]
    pub timestamp_ms: u64,
}

// ── Shared screen ──────────────────────────────────────────────────

/// The single process-wide presentation mode: normal conversation, or a
/// timed "thinking" countdown for one agent. At most one `Thinking` value
/// exists per orchestrator at any instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum SharedScreen {
    Conversation,
    Thinking {
        speaker: SpeakerId,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
        #[serde(rename = "startedAt")]
        started_at: u64,
        #[serde(rename = "endsAt")]
        ends_at: u64,
    },
}

impl SharedScreen {
    pub fn is_thinking(&self) -> bool {
        matches!(self, Self::Thinking { .. })
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speaker_serialization_is_lowercase() {
        assert_eq!(serde_json::to_string(&SpeakerId::Human).unwrap(), "\"human\"");
        assert_eq!(serde_json::to_string(&SpeakerId::Host).unwrap(), "\"host\"");
        assert_eq!(serde_json::to_string(&SpeakerId::Guest).unwrap(), "\"guest\"");
    }

    #[test]
    fn agents_excludes_human() {
        assert!(SpeakerId::agents().iter().all(|s| s.is_agent()));
        assert!(!SpeakerId::Human.is_agent());
    }

    #[test]
    fn other_agent_flips() {
        assert_eq!(SpeakerId::Host.other_agent(), SpeakerId::Guest);
        assert_eq!(SpeakerId::Guest.other_agent(), SpeakerId::Host);
    }

    #[test]
    fn shared_screen_tagging() {
        let json = serde_json::to_string(&SharedScreen::Conversation).unwrap();
        assert!(json.contains("conversation"));

        let thinking = SharedScreen::Thinking {
            speaker: SpeakerId::Host,
            duration_ms: 30_000,
            started_at: 1_000,
            ends_at: 31_000,
        };
        let json = serde_json::to_string(&thinking).unwrap();
        assert!(json.contains("thinking"));
        assert!(json.contains("durationMs"));
        assert!(json.contains("endsAt"));
        let back: SharedScreen = serde_json::from_str(&json).unwrap();
        assert_eq!(back, thinking);
    }

    #[test]
    fn orb_state_serialization() {
        assert_eq!(serde_json::to_string(&OrbState::Listening).unwrap(), "\"listening\"");
        assert_eq!(serde_json::to_string(&OrbState::Muted).unwrap(), "\"muted\"");
    }
}
