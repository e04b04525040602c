//! Sample-accurate gain control for agent audio ("ducking").
//!
//! One [`DuckingProcessor`] per speaker applies a ramped gain to outgoing
//! PCM16LE audio so attenuation changes are click-free. The ramp is advanced
//! per sample, so a transition started mid-buffer lands exactly where the
//! clock says it should. [`DuckingMixer`] is the multi-speaker facade used by
//! a session: channels are created lazily on first audio for a speaker and
//! outlive individual TTS turns.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::audio::{db_to_gain, gain_to_db};
use crate::session::SpeakerId;

// ── Profiles and curves ────────────────────────────────────────────

/// How strongly a ducked channel is attenuated.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuckingProfile {
    /// -6 dB.
    Soft,
    /// -12 dB.
    Medium,
    /// -18 dB.
    Hard,
    /// Explicit reduction in dB (negative values attenuate).
    Custom(f64),
}

impl DuckingProfile {
    /// Attenuation in dB applied while ducked.
    pub fn reduction_db(self) -> f64 {
        match self {
            Self::Soft => -6.0,
            Self::Medium => -12.0,
            Self::Hard => -18.0,
            Self::Custom(db) => db,
        }
    }
}

/// Shape of the gain transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RampCurve {
    /// Straight interpolation.
    Linear,
    /// `p^2`: slow start, fast finish.
    Exponential,
    /// `1 - (1-p)^2`: fast start, slow finish.
    Logarithmic,
}

impl RampCurve {
    fn shape(self, p: f64) -> f64 {
        match self {
            Self::Linear => p,
            Self::Exponential => p * p,
            Self::Logarithmic => 1.0 - (1.0 - p) * (1.0 - p),
        }
    }
}

/// Configuration shared by all channels of a session.
#[derive(Debug, Clone)]
pub struct DuckingConfig {
    pub profile: DuckingProfile,
    /// Transition length into the ducked state.
    pub ramp_up_ms: u64,
    /// Transition length back to unity. Slower than attack so restoration
    /// is not jarring.
    pub ramp_down_ms: u64,
    pub curve: RampCurve,
    pub sample_rate: u32,
}

impl Default for DuckingConfig {
    fn default() -> Self {
        Self {
            profile: DuckingProfile::Medium,
            ramp_up_ms: 50,
            ramp_down_ms: 150,
            curve: RampCurve::Exponential,
            sample_rate: 48_000,
        }
    }
}

// ── Gain ramp ──────────────────────────────────────────────────────

/// A single in-flight gain transition.
///
/// Invariants: `0 <= current_gain <= 1`; while `active`,
/// `elapsed_samples <= ramp_samples_total`; on completion
/// `current_gain == target_gain` and `active == false`.
#[derive(Debug, Clone)]
struct GainRamp {
    active: bool,
    start_gain: f64,
    target_gain: f64,
    current_gain: f64,
    ramp_samples_total: u64,
    elapsed_samples: u64,
    curve: RampCurve,
}

impl GainRamp {
    fn new(curve: RampCurve) -> Self {
        Self {
            active: false,
            start_gain: 1.0,
            target_gain: 1.0,
            current_gain: 1.0,
            ramp_samples_total: 0,
            elapsed_samples: 0,
            curve,
        }
    }

    fn set_immediate(&mut self, target: f64) {
        self.current_gain = target;
        self.target_gain = target;
        self.active = false;
    }

    fn begin(&mut self, target: f64, duration_samples: u64) {
        if duration_samples == 0 {
            self.set_immediate(target);
            return;
        }
        self.start_gain = self.current_gain;
        self.target_gain = target;
        self.ramp_samples_total = duration_samples;
        self.elapsed_samples = 0;
        self.active = true;
    }

    /// Gain for the next sample, advancing the ramp position.
    fn next_gain(&mut self) -> f64 {
        if !self.active {
            return self.current_gain;
        }
        let p = self.elapsed_samples as f64 / self.ramp_samples_total as f64;
        let shaped = self.curve.shape(p);
        self.current_gain = self.start_gain + (self.target_gain - self.start_gain) * shaped;
        let gain = self.current_gain;
        self.elapsed_samples += 1;
        if self.elapsed_samples >= self.ramp_samples_total {
            self.current_gain = self.target_gain;
            self.active = false;
        }
        gain
    }
}

// ── Per-speaker processor ──────────────────────────────────────────

/// Applies the ducking gain to one speaker's audio stream.
pub struct DuckingProcessor {
    config: DuckingConfig,
    ducked_gain: f64,
    ramp: GainRamp,
}

impl DuckingProcessor {
    pub fn new(config: DuckingConfig) -> Self {
        let ducked_gain = db_to_gain(config.profile.reduction_db());
        let ramp = GainRamp::new(config.curve);
        Self {
            config,
            ducked_gain,
            ramp,
        }
    }

    /// Begin attenuating. `immediate` skips the ramp.
    pub fn start_ducking(&mut self, immediate: bool) {
        if immediate {
            self.ramp.set_immediate(self.ducked_gain);
        } else {
            let samples = self.ms_to_samples(self.config.ramp_up_ms);
            self.ramp.begin(self.ducked_gain, samples);
        }
    }

    /// Restore unity gain. `immediate` skips the ramp.
    pub fn stop_ducking(&mut self, immediate: bool) {
        if immediate {
            self.ramp.set_immediate(1.0);
        } else {
            let samples = self.ms_to_samples(self.config.ramp_down_ms);
            self.ramp.begin(1.0, samples);
        }
    }

    /// Apply the current gain to a PCM16LE buffer.
    ///
    /// Output length always equals input length; a trailing odd byte is
    /// copied through unchanged. At steady unity gain the output equals the
    /// input byte-for-byte. One output buffer is allocated per call, nothing
    /// per sample.
    pub fn process(&mut self, input: &[u8]) -> Vec<u8> {
        if !self.ramp.active && self.ramp.current_gain == 1.0 {
            return input.to_vec();
        }

        let mut out = Vec::with_capacity(input.len());
        for chunk in input.chunks_exact(2) {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
            let gain = self.ramp.next_gain();
            let scaled = (sample * gain).round().clamp(-32768.0, 32767.0) as i16;
            out.extend_from_slice(&scaled.to_le_bytes());
        }
        if input.len() % 2 == 1 {
            out.push(input[input.len() - 1]);
        }
        out
    }

    /// Whether the channel is (or is heading) below unity.
    pub fn is_ducking(&self) -> bool {
        self.ramp.current_gain < 0.99 || self.ramp.target_gain < 0.99
    }

    /// Whether a transition is in flight.
    pub fn is_ramping(&self) -> bool {
        self.ramp.active
    }

    pub fn current_gain(&self) -> f64 {
        self.ramp.current_gain
    }

    pub fn current_gain_db(&self) -> f64 {
        gain_to_db(self.ramp.current_gain)
    }

    fn ms_to_samples(&self, ms: u64) -> u64 {
        u64::from(self.config.sample_rate) * ms / 1000
    }
}

// ── Multi-speaker facade ───────────────────────────────────────────

/// Reported state of one channel.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ChannelStatus {
    pub ducking: bool,
    pub gain: f64,
    pub gain_db: f64,
}

/// Maps speakers to their processors, creating channels lazily.
pub struct DuckingMixer {
    config: DuckingConfig,
    channels: HashMap<SpeakerId, DuckingProcessor>,
}

impl DuckingMixer {
    pub fn new(config: DuckingConfig) -> Self {
        Self {
            config,
            channels: HashMap::new(),
        }
    }

    fn channel(&mut self, speaker: SpeakerId) -> &mut DuckingProcessor {
        let config = self.config.clone();
        self.channels
            .entry(speaker)
            .or_insert_with(|| DuckingProcessor::new(config))
    }

    /// Begin ducking every listed speaker.
    pub fn start_ducking(&mut self, speakers: &[SpeakerId], immediate: bool) {
        for &speaker in speakers {
            self.channel(speaker).start_ducking(immediate);
        }
    }

    /// Restore every listed speaker toward unity.
    pub fn stop_ducking(&mut self, speakers: &[SpeakerId], immediate: bool) {
        for &speaker in speakers {
            self.channel(speaker).stop_ducking(immediate);
        }
    }

    /// Run one speaker's audio through its channel.
    pub fn process(&mut self, speaker: SpeakerId, input: &[u8]) -> Vec<u8> {
        self.channel(speaker).process(input)
    }

    /// Whether any channel is currently ducked.
    pub fn any_ducking(&self) -> bool {
        self.channels.values().any(DuckingProcessor::is_ducking)
    }

    /// Per-speaker gain report.
    pub fn status(&self) -> HashMap<SpeakerId, ChannelStatus> {
        self.channels
            .iter()
            .map(|(speaker, ch)| {
                (
                    *speaker,
                    ChannelStatus {
                        ducking: ch.is_ducking(),
                        gain: ch.current_gain(),
                        gain_db: ch.current_gain_db(),
                    },
                )
            })
            .collect()
    }
}

// ── Tests ──────────────────────────────────────────────────────────
