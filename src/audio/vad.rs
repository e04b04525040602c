//! Energy/confidence voice activity detection.
//!
//! Converts a stream of PCM16LE frames into speech-start / speech-end edges
//! plus a continuous `[0, 1]` confidence signal, robust to background noise.
//!
//! ## Design
//!
//! The detector is a pure state machine: [`EnhancedVad::process`] consumes a
//! byte buffer and returns the edges it produced, so the caller decides how
//! to fan them out. Three mechanisms keep it stable against noise:
//!
//! 1. **Adaptive noise floor** — while not speaking, sub-threshold frames
//!    pull an exponential estimate of the ambient level; speech and release
//!    thresholds are derived from it (`floor x 2.5` / `floor x 1.5`).
//! 2. **Hysteresis** — a transition needs `speech_frames_required`
//!    consecutive loud frames to start and `silence_frames_required` quiet
//!    frames to end; frames in the band between the two thresholds decay the
//!    start counter instead of resetting it.
//! 3. **Confidence gating** — a blend of SNR, frame-to-frame consistency,
//!    and a spectral placeholder lowers the effective start threshold when
//!    the signal looks voice-like, and blocks starts below 0.4 confidence.

use std::collections::VecDeque;

use crate::audio::clamp01;

/// Frames of energy/confidence history retained.
const HISTORY_FRAMES: usize = 50;
/// Frames examined by the confidence estimators.
const CONFIDENCE_WINDOW: usize = 10;
/// Noise-floor clamp range.
const NOISE_FLOOR_MIN: f64 = 0.0001;
const NOISE_FLOOR_MAX: f64 = 0.1;
/// Threshold multipliers over the noise floor.
const SPEECH_FACTOR: f64 = 2.5;
const RELEASE_FACTOR: f64 = 1.5;
/// Peak tracker decay per frame.
const PEAK_DECAY: f64 = 0.999;
/// Temporal smoothing weight on the previous confidence.
const CONFIDENCE_SMOOTHING: f64 = 0.85;
/// How strongly confidence lowers the effective start threshold.
const CONFIDENCE_GATE_DEPTH: f64 = 0.3;
/// Minimum smoothed confidence required to start speech (when gating is on).
const MIN_START_CONFIDENCE: f64 = 0.4;

// ── Configuration ──────────────────────────────────────────────────

/// Configuration for [`EnhancedVad`].
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Input sample rate in Hz.
    pub sample_rate: u32,
    /// Analysis frame length in milliseconds.
    pub frame_ms: u32,
    /// Adapt the noise floor from sub-threshold frames.
    pub adaptive: bool,
    /// Gate the effective start threshold on the confidence signal.
    pub confidence_gating: bool,
    /// Whether the spectral estimator is wired up (placeholder contract:
    /// 0.7 when enabled, 0.5 when disabled).
    pub spectral_enabled: bool,
    /// Starting noise-floor estimate (clamped into `[0.0001, 0.1]`).
    pub initial_noise_floor: f64,
    /// Exponential update rate for the adaptive noise floor.
    pub noise_floor_alpha: f64,
    /// Consecutive loud frames required to start speech.
    /// `None` derives `ceil(120ms / frame_ms)`.
    pub speech_frames_required: Option<usize>,
    /// Consecutive quiet frames required to end speech.
    /// `None` derives `ceil(220ms / frame_ms)`.
    pub silence_frames_required: Option<usize>,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            frame_ms: 20,
            adaptive: true,
            confidence_gating: true,
            spectral_enabled: true,
            initial_noise_floor: 0.01,
            noise_floor_alpha: 0.01,
            speech_frames_required: None,
            silence_frames_required: None,
        }
    }
}

// ── Events ─────────────────────────────────────────────────────────

/// Edge emitted by the detector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VadEvent {
    /// Speech onset, with the smoothed confidence at the transition.
    SpeechStart { confidence: f64 },
    /// Speech offset, with the confidence just before it was halved.
    SpeechEnd { confidence: f64 },
}

// ── Detector ───────────────────────────────────────────────────────

/// Frame-by-frame speech/silence classifier with adaptive thresholds.
pub struct EnhancedVad {
    frame_samples: usize,
    speech_frames_required: usize,
    silence_frames_required: usize,
    adaptive: bool,
    confidence_gating: bool,
    spectral_enabled: bool,
    noise_floor_alpha: f64,

    noise_floor: f64,
    speech_threshold: f64,
    release_threshold: f64,
    peak_energy: f64,
    energy_history: VecDeque<f64>,
    confidence_history: VecDeque<f64>,
    current_confidence: f64,
    speaking: bool,
    speech_frame_count: usize,
    silence_frame_count: usize,
}

impl EnhancedVad {
    /// Create a detector from the given configuration.
    pub fn new(config: &VadConfig) -> Self {
        let frame_ms = config.frame_ms.max(1) as u64;
        let frame_samples = (config.sample_rate as u64 * frame_ms / 1000).max(1) as usize;
        let noise_floor = config
            .initial_noise_floor
            .clamp(NOISE_FLOOR_MIN, NOISE_FLOOR_MAX);

        Self {
            frame_samples,
            speech_frames_required: config
                .speech_frames_required
                .unwrap_or_else(|| (120 + frame_ms as usize - 1) / frame_ms as usize),
            silence_frames_required: config
                .silence_frames_required
                .unwrap_or_else(|| (220 + frame_ms as usize - 1) / frame_ms as usize),
            adaptive: config.adaptive,
            confidence_gating: config.confidence_gating,
            spectral_enabled: config.spectral_enabled,
            noise_floor_alpha: config.noise_floor_alpha,
            noise_floor,
            speech_threshold: noise_floor * SPEECH_FACTOR,
            release_threshold: noise_floor * RELEASE_FACTOR,
            peak_energy: 0.0,
            energy_history: VecDeque::with_capacity(HISTORY_FRAMES),
            confidence_history: VecDeque::with_capacity(HISTORY_FRAMES),
            current_confidence: 0.0,
            speaking: false,
            speech_frame_count: 0,
            silence_frame_count: 0,
        }
    }

    /// Feed a PCM16LE byte buffer; returns the edges produced by the full
    /// frames it contained. Zero-length input is a no-op; odd or partial
    /// trailing bytes are skipped with a log line. Never fails.
    pub fn process(&mut self, pcm: &[u8]) -> Vec<VadEvent> {
        if pcm.is_empty() {
            return Vec::new();
        }

        let frame_bytes = self.frame_samples * 2;
        let remainder = pcm.len() % frame_bytes;
        if remainder != 0 {
            tracing::warn!(
                bytes = pcm.len(),
                skipped = remainder,
                "audio buffer not frame-aligned, skipping trailing bytes"
            );
        }

        let mut events = Vec::new();
        for frame in pcm.chunks_exact(frame_bytes) {
            if let Some(event) = self.process_frame(frame) {
                events.push(event);
            }
        }
        events
    }

    fn process_frame(&mut self, frame: &[u8]) -> Option<VadEvent> {
        let rms = frame_rms(frame);

        if self.energy_history.len() == HISTORY_FRAMES {
            self.energy_history.pop_front();
        }
        self.energy_history.push_back(rms);

        self.peak_energy = (self.peak_energy * PEAK_DECAY).max(rms);

        if self.adaptive && !self.speaking && rms < self.speech_threshold {
            let a = self.noise_floor_alpha;
            self.noise_floor = (self.noise_floor * (1.0 - a) + rms * a)
                .clamp(NOISE_FLOOR_MIN, NOISE_FLOOR_MAX);
            self.speech_threshold = self.noise_floor * SPEECH_FACTOR;
            self.release_threshold = self.noise_floor * RELEASE_FACTOR;
        }

        let spectral = if self.spectral_enabled { 0.7 } else { 0.5 };
        let overall = 0.4 * self.energy_confidence()
            + 0.4 * self.consistency_confidence()
            + 0.2 * spectral;
        self.current_confidence = CONFIDENCE_SMOOTHING * self.current_confidence
            + (1.0 - CONFIDENCE_SMOOTHING) * overall;

        if self.confidence_history.len() == HISTORY_FRAMES {
            self.confidence_history.pop_front();
        }
        self.confidence_history.push_back(self.current_confidence);

        let effective = if self.confidence_gating {
            self.speech_threshold * (1.0 - CONFIDENCE_GATE_DEPTH * self.current_confidence)
        } else {
            self.speech_threshold
        };

        if !self.speaking {
            if rms >= effective {
                self.speech_frame_count += 1;
                let confident = !self.confidence_gating
                    || self.current_confidence >= MIN_START_CONFIDENCE;
                if self.speech_frame_count >= self.speech_frames_required && confident {
                    self.speaking = true;
                    self.speech_frame_count = 0;
                    self.silence_frame_count = 0;
                    return Some(VadEvent::SpeechStart {
                        confidence: self.current_confidence,
                    });
                }
            } else if rms > self.release_threshold {
                // Between release and effective: leak the counter instead of
                // resetting so a brief dip doesn't restart the onset window.
                self.speech_frame_count = self.speech_frame_count.saturating_sub(1);
            } else {
                self.speech_frame_count = 0;
            }
        } else if rms <= self.release_threshold {
            self.silence_frame_count += 1;
            if self.silence_frame_count >= self.silence_frames_required {
                self.speaking = false;
                self.speech_frame_count = 0;
                self.silence_frame_count = 0;
                let confidence = self.current_confidence;
                self.current_confidence *= 0.5;
                return Some(VadEvent::SpeechEnd { confidence });
            }
        } else {
            self.silence_frame_count = 0;
        }

        None
    }

    /// SNR-based confidence over the recent energy window.
    fn energy_confidence(&self) -> f64 {
        let len = self.window_len();
        if len == 0 {
            return 0.0;
        }
        let mean = self.window_iter().sum::<f64>() / len as f64;
        let snr_db = 20.0 * (mean / self.noise_floor.max(NOISE_FLOOR_MIN)).log10();
        clamp01((snr_db - 5.0) / 15.0)
    }

    /// Coefficient-of-variation confidence: steady energy reads as voiced.
    fn consistency_confidence(&self) -> f64 {
        let len = self.window_len();
        if len < 5 {
            return 0.5;
        }
        let mean = self.window_iter().sum::<f64>() / len as f64;
        if mean < 1e-12 {
            return 0.5;
        }
        let variance = self
            .window_iter()
            .map(|e| (e - mean) * (e - mean))
            .sum::<f64>()
            / len as f64;
        let cv = variance.sqrt() / mean;
        clamp01(1.0 - (cv - 0.3) / 0.7)
    }

    fn window_len(&self) -> usize {
        self.energy_history.len().min(CONFIDENCE_WINDOW)
    }

    fn window_iter(&self) -> impl Iterator<Item = f64> + '_ {
        let start = self.energy_history.len().saturating_sub(CONFIDENCE_WINDOW);
        self.energy_history.iter().skip(start).copied()
    }

    /// Whether the detector currently classifies the stream as speech.
    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Smoothed confidence in `[0, 1]`.
    pub fn confidence(&self) -> f64 {
        self.current_confidence
    }

    /// Current noise-floor estimate.
    pub fn noise_floor(&self) -> f64 {
        self.noise_floor
    }

    /// Current speech (start) threshold.
    pub fn speech_threshold(&self) -> f64 {
        self.speech_threshold
    }

    /// Current release (end) threshold.
    pub fn release_threshold(&self) -> f64 {
        self.release_threshold
    }

    /// Slow-decay peak energy tracker.
    pub fn peak_energy(&self) -> f64 {
        self.peak_energy
    }

    /// Frame length in samples.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }
}

fn frame_rms(frame: &[u8]) -> f64 {
    let n = frame.len() / 2;
    if n == 0 {
        return 0.0;
    }
    let mut sum = 0.0f64;
    for chunk in frame.chunks_exact(2) {
        let s = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
        sum += s * s;
    }
    (sum / n as f64).sqrt()
}

// ── Tests ──────────────────────────────────────────────────────────
