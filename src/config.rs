//! Runtime configuration.
//!
//! A TOML file acts as a partial overlay on top of the defaults below; every
//! section and field may be omitted. The loaded [`Config`] is immutable for
//! the process lifetime — sessions read it through an `Arc`, so in-flight
//! audio never observes a torn config.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::audio::ducking::{DuckingConfig, DuckingProfile, RampCurve};
use crate::audio::vad::VadConfig;
use crate::floor::barge_in::{BargeInConfig, BargeInMode};
use crate::floor::router::RouterConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSettings,
    pub audio: AudioSettings,
    pub vad: VadSettings,
    pub ducking: DuckingSettings,
    pub barge_in: BargeInSettings,
    pub router: RouterSettings,
    pub recording: RecordingSettings,
    pub features: FeatureSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address for the WebSocket gateway.
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9470".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Microphone/TTS sample rate in Hz.
    pub sample_rate: u32,
    /// VAD analysis frame length in milliseconds.
    pub frame_ms: u32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VadSettings {
    pub adaptive: bool,
    pub confidence_gating: bool,
    pub spectral: bool,
    pub initial_noise_floor: f64,
    pub noise_floor_alpha: f64,
}

impl Default for VadSettings {
    fn default() -> Self {
        Self {
            adaptive: true,
            confidence_gating: true,
            spectral: true,
            initial_noise_floor: 0.01,
            noise_floor_alpha: 0.01,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DuckingSettings {
    pub profile: DuckingProfile,
    pub ramp_up_ms: u64,
    pub ramp_down_ms: u64,
    pub curve: RampCurve,
}

impl Default for DuckingSettings {
    fn default() -> Self {
        Self {
            profile: DuckingProfile::Medium,
            ramp_up_ms: 50,
            ramp_down_ms: 150,
            curve: RampCurve::Exponential,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BargeInSettings {
    pub mode: BargeInMode,
    pub grace_period_ms: u64,
    pub sentence_completion_max_ms: u64,
    pub ducking_enabled: bool,
    pub ducking_lead_time_ms: u64,
}

impl Default for BargeInSettings {
    fn default() -> Self {
        Self {
            mode: BargeInMode::Graceful,
            grace_period_ms: 300,
            sentence_completion_max_ms: 2000,
            ducking_enabled: true,
            ducking_lead_time_ms: 150,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouterSettings {
    pub host_aliases: Vec<String>,
    pub guest_aliases: Vec<String>,
    pub human_aliases: Vec<String>,
}

impl Default for RouterSettings {
    fn default() -> Self {
        let defaults = RouterConfig::default();
        Self {
            host_aliases: defaults.host_aliases,
            guest_aliases: defaults.guest_aliases,
            human_aliases: defaults.human_aliases,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub enabled: bool,
    /// Root directory; one subtree per episode.
    pub dir: PathBuf,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("./recordings"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    /// Enable the per-speaker ducking mixer and the barge-in manager.
    /// When off, agent audio gets a single static attenuation while the
    /// human speaks and interruptions stop agents immediately.
    pub enhanced_audio: bool,
    /// Static attenuation used by the non-enhanced fallback path.
    pub static_ducking_db: f64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            enhanced_audio: true,
            static_ducking_db: -12.0,
        }
    }
}

impl Config {
    /// Load from a TOML file; a missing path (or `None`) yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn vad_config(&self) -> VadConfig {
        VadConfig {
            sample_rate: self.audio.sample_rate,
            frame_ms: self.audio.frame_ms,
            adaptive: self.vad.adaptive,
            confidence_gating: self.vad.confidence_gating,
            spectral_enabled: self.vad.spectral,
            initial_noise_floor: self.vad.initial_noise_floor,
            noise_floor_alpha: self.vad.noise_floor_alpha,
            speech_frames_required: None,
            silence_frames_required: None,
        }
    }

    pub fn ducking_config(&self) -> DuckingConfig {
        DuckingConfig {
            profile: self.ducking.profile,
            ramp_up_ms: self.ducking.ramp_up_ms,
            ramp_down_ms: self.ducking.ramp_down_ms,
            curve: self.ducking.curve,
            sample_rate: self.audio.sample_rate,
        }
    }

    pub fn barge_in_config(&self) -> BargeInConfig {
        BargeInConfig {
            mode: self.barge_in.mode,
            grace_period_ms: self.barge_in.grace_period_ms,
            sentence_completion_max_ms: self.barge_in.sentence_completion_max_ms,
            ducking_enabled: self.barge_in.ducking_enabled,
            ducking_lead_time_ms: self.barge_in.ducking_lead_time_ms,
        }
    }

    pub fn router_config(&self) -> RouterConfig {
        RouterConfig {
            host_aliases: self.router.host_aliases.clone(),
            guest_aliases: self.router.guest_aliases.clone(),
            human_aliases: self.router.human_aliases.clone(),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.audio.sample_rate, 48_000);
        assert_eq!(config.audio.frame_ms, 20);
        assert_eq!(config.barge_in.grace_period_ms, 300);
        assert!(config.features.enhanced_audio);
        assert_eq!(config.router.host_aliases, vec!["claude".to_string()]);
    }

    #[test]
    fn partial_toml_overlays_defaults() {
        let raw = r#"
            [server]
            bind = "0.0.0.0:9000"

            [ducking]
            profile = "hard"
            curve = "linear"

            [barge_in]
            mode = "sentence_complete"
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:9000");
        assert_eq!(config.ducking.profile, DuckingProfile::Hard);
        assert_eq!(config.ducking.curve, RampCurve::Linear);
        assert_eq!(config.barge_in.mode, BargeInMode::SentenceComplete);
        // Untouched sections keep defaults
        assert_eq!(config.audio.sample_rate, 48_000);
        assert!(config.recording.enabled);
    }

    #[test]
    fn custom_ducking_profile_parses() {
        let raw = r#"
            [ducking]
            profile = { custom = -9.0 }
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.ducking.profile.reduction_db(), -9.0);
    }

    #[test]
    fn conversions_carry_audio_settings() {
        let mut config = Config::default();
        config.audio.sample_rate = 16_000;
        assert_eq!(config.vad_config().sample_rate, 16_000);
        assert_eq!(config.ducking_config().sample_rate, 16_000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/greenroom.toml"))).unwrap();
        assert_eq!(config.audio.frame_ms, 20);
    }
}
