//! Audio primitives shared by the VAD and the ducking processor.
//!
//! All wire audio is little-endian 16-bit mono PCM. Gains are linear-domain
//! values in `[0, 1]`; decibels are derived (`gain_to_db(0) = -inf`).

pub mod ducking;
pub mod vad;

/// Convert a decibel value to a linear gain.
pub fn db_to_gain(db: f64) -> f64 {
    10f64.powf(db / 20.0)
}

/// Convert a linear gain to decibels. Zero gain maps to negative infinity.
pub fn gain_to_db(gain: f64) -> f64 {
    if gain <= 0.0 {
        f64::NEG_INFINITY
    } else {
        20.0 * gain.log10()
    }
}

/// RMS of a PCM16LE byte buffer over samples normalized to `[-1, 1)`.
///
/// A trailing odd byte is ignored. Empty input returns 0.
pub fn pcm_rms(pcm: &[u8]) -> f64 {
    let n = pcm.len() / 2;
    if n == 0 {
        return 0.0;
    }
    let mut sum_squares = 0.0f64;
    for chunk in pcm.chunks_exact(2) {
        let s = i16::from_le_bytes([chunk[0], chunk[1]]) as f64 / 32768.0;
        sum_squares += s * s;
    }
    (sum_squares / n as f64).sqrt()
}

/// Clamp a value into `[0, 1]`.
pub fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Apply a flat gain to a PCM16LE buffer: round to nearest, saturate to
/// the i16 range. A trailing odd byte is copied through unchanged.
pub fn scale_pcm(pcm: &[u8], gain: f64) -> Vec<u8> {
    let mut out = Vec::with_capacity(pcm.len());
    for chunk in pcm.chunks_exact(2) {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]) as f64;
        let scaled = (sample * gain).round().clamp(-32768.0, 32767.0) as i16;
        out.extend_from_slice(&scaled.to_le_bytes());
    }
    if pcm.len() % 2 == 1 {
        out.push(pcm[pcm.len() - 1]);
    }
    out
}
