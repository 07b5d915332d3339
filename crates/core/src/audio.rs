//! Audio format types and PCM utilities

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Supported audio sample rates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SampleRate {
    /// 8kHz - Telephony
    Hz8000,
    /// 16kHz - Standard speech recognition
    Hz16000,
    /// 22.05kHz - Legacy TTS output
    Hz22050,
    /// 24kHz - Kokoro-class TTS output
    #[default]
    Hz24000,
    /// 44.1kHz - CD quality
    Hz44100,
    /// 48kHz - Professional audio
    Hz48000,
    /// Anything else; accepted with a warning at the interface
    Other(u32),
}

impl SampleRate {
    /// Get sample rate as u32
    pub fn as_u32(&self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz22050 => 22050,
            SampleRate::Hz24000 => 24000,
            SampleRate::Hz44100 => 44100,
            SampleRate::Hz48000 => 48000,
            SampleRate::Other(hz) => *hz,
        }
    }

    /// Build from a raw rate, logging a warning for unusual values
    pub fn from_hz(hz: u32) -> Self {
        match hz {
            8000 => SampleRate::Hz8000,
            16000 => SampleRate::Hz16000,
            22050 => SampleRate::Hz22050,
            24000 => SampleRate::Hz24000,
            44100 => SampleRate::Hz44100,
            48000 => SampleRate::Hz48000,
            other => {
                tracing::warn!(rate = other, "Unusual sample rate accepted");
                SampleRate::Other(other)
            },
        }
    }

    /// Samples in a chunk of the given duration
    pub fn samples_for_ms(&self, ms: u64) -> usize {
        (self.as_u32() as u64 * ms / 1000) as usize
    }
}

/// Bit depth of the PCM stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum BitDepth {
    B8,
    #[default]
    B16,
    B24,
    B32,
}

impl BitDepth {
    pub fn bits(&self) -> u16 {
        match self {
            BitDepth::B8 => 8,
            BitDepth::B16 => 16,
            BitDepth::B24 => 24,
            BitDepth::B32 => 32,
        }
    }

    pub fn bytes(&self) -> usize {
        self.bits() as usize / 8
    }

    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(BitDepth::B8),
            16 => Some(BitDepth::B16),
            24 => Some(BitDepth::B24),
            32 => Some(BitDepth::B32),
            _ => None,
        }
    }
}

/// Audio channel configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Channels {
    #[default]
    Mono,
    Stereo,
}

impl Channels {
    pub fn count(&self) -> usize {
        match self {
            Channels::Mono => 1,
            Channels::Stereo => 2,
        }
    }

    pub fn from_count(count: u16) -> Option<Self> {
        match count {
            1 => Some(Channels::Mono),
            2 => Some(Channels::Stereo),
            _ => None,
        }
    }
}

/// Concrete PCM stream format
///
/// Default is the service-wide calibration: s16le, 24000 Hz, mono.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct AudioFormat {
    pub sample_rate: SampleRate,
    pub channels: Channels,
    pub bit_depth: BitDepth,
}

impl AudioFormat {
    pub fn bytes_per_second(&self) -> usize {
        self.sample_rate.as_u32() as usize * self.channels.count() * self.bit_depth.bytes()
    }

    pub fn bytes_for_ms(&self, ms: u64) -> usize {
        // Round down to a whole frame so chunk boundaries never split a sample
        let raw = self.bytes_per_second() as u64 * ms / 1000;
        let frame = (self.channels.count() * self.bit_depth.bytes()) as u64;
        (raw - raw % frame) as usize
    }

    /// Duration represented by `byte_len` bytes of this format
    pub fn duration_of(&self, byte_len: usize) -> Duration {
        Duration::from_secs_f64(byte_len as f64 / self.bytes_per_second() as f64)
    }
}

/// PCM16 scaling constants, mirrored from the WAV/PCM spec
const PCM16_SCALE: f32 = 32767.0;
const PCM16_NORMALIZE: f32 = 32768.0;

/// Convert f32 samples (normalized to [-1.0, 1.0]) to PCM bytes at a bit depth
pub fn samples_to_pcm(samples: &[f32], depth: BitDepth) -> Vec<u8> {
    match depth {
        BitDepth::B8 => samples
            .iter()
            .map(|&s| {
                // 8-bit WAV is unsigned, midpoint 128
                let clamped = s.clamp(-1.0, 1.0);
                ((clamped * 127.0) + 128.0) as u8
            })
            .collect(),
        BitDepth::B16 => samples
            .iter()
            .flat_map(|&s| {
                let clamped = s.clamp(-1.0, 1.0);
                ((clamped * PCM16_SCALE) as i16).to_le_bytes()
            })
            .collect(),
        BitDepth::B24 => samples
            .iter()
            .flat_map(|&s| {
                let clamped = s.clamp(-1.0, 1.0);
                let v = (clamped * 8_388_607.0) as i32;
                let b = v.to_le_bytes();
                [b[0], b[1], b[2]]
            })
            .collect(),
        BitDepth::B32 => samples
            .iter()
            .flat_map(|&s| {
                let clamped = s.clamp(-1.0, 1.0);
                ((clamped as f64 * 2_147_483_647.0) as i32).to_le_bytes()
            })
            .collect(),
    }
}

/// Convert PCM16 little-endian bytes back to f32 samples
pub fn pcm16_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|chunk| {
            let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
            sample as f32 / PCM16_NORMALIZE
        })
        .collect()
}

/// Duplicate mono samples across two channels
pub fn mono_to_stereo(samples: &[f32]) -> Vec<f32> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.push(s);
        out.push(s);
    }
    out
}

/// Resample mono f32 audio between rates
///
/// Uses an FFT-based Rubato resampler; very short inputs fall back to linear
/// interpolation, matching the behavior expected at segment seams.
pub fn resample(samples: &[f32], from: SampleRate, to: SampleRate) -> Vec<f32> {
    use rubato::{FftFixedIn, Resampler};

    if from == to || samples.is_empty() {
        return samples.to_vec();
    }

    if samples.len() < 64 {
        return resample_linear(samples, from, to);
    }

    let samples_f64: Vec<f64> = samples.iter().map(|&s| s as f64).collect();
    let chunk_size = samples.len().min(1024);

    match FftFixedIn::<f64>::new(from.as_u32() as usize, to.as_u32() as usize, chunk_size, 2, 1) {
        Ok(mut resampler) => {
            let input_frames = vec![samples_f64];
            match resampler.process(&input_frames, None) {
                Ok(output_frames) => output_frames[0].iter().map(|&s| s as f32).collect(),
                Err(e) => {
                    tracing::warn!("Rubato processing failed, using linear fallback: {}", e);
                    resample_linear(samples, from, to)
                },
            }
        },
        Err(e) => {
            tracing::warn!("Rubato init failed, using linear fallback: {}", e);
            resample_linear(samples, from, to)
        },
    }
}

fn resample_linear(samples: &[f32], from: SampleRate, to: SampleRate) -> Vec<f32> {
    let ratio = to.as_u32() as f64 / from.as_u32() as f64;
    let new_len = (samples.len() as f64 * ratio) as usize;

    let mut resampled = Vec::with_capacity(new_len);
    for i in 0..new_len {
        let src_idx = i as f64 / ratio;
        let idx_floor = src_idx.floor() as usize;
        let idx_ceil = (idx_floor + 1).min(samples.len().saturating_sub(1));
        let frac = src_idx - idx_floor as f64;

        let sample = samples[idx_floor] * (1.0 - frac as f32) + samples[idx_ceil] * frac as f32;
        resampled.push(sample);
    }
    resampled
}

/// Blend the tail of `head` into the front of `tail` with a linear ramp
///
/// `fade_samples` is clamped to the shorter of the two slices. The result
/// replaces the overlapping region: total length is
/// `head.len() + tail.len() - fade_samples`.
pub fn cross_fade(head: &[f32], tail: &[f32], fade_samples: usize) -> Vec<f32> {
    let fade = fade_samples.min(head.len()).min(tail.len());
    if fade == 0 {
        let mut out = head.to_vec();
        out.extend_from_slice(tail);
        return out;
    }

    let mut out = Vec::with_capacity(head.len() + tail.len() - fade);
    out.extend_from_slice(&head[..head.len() - fade]);

    let head_tail = &head[head.len() - fade..];
    for i in 0..fade {
        let t = (i + 1) as f32 / (fade + 1) as f32;
        out.push(head_tail[i] * (1.0 - t) + tail[i] * t);
    }

    out.extend_from_slice(&tail[fade..]);
    out
}

/// RMS energy in decibels, used for underrun/silence classification
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return -96.0;
    }

    let sum_squares: f32 = samples.iter().map(|s| s * s).sum();
    let rms = (sum_squares / samples.len() as f32).sqrt();

    if rms > 0.0 {
        20.0 * rms.log10()
    } else {
        -96.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_rate_conversions() {
        assert_eq!(SampleRate::Hz24000.as_u32(), 24000);
        assert_eq!(SampleRate::Hz24000.samples_for_ms(50), 1200);
        assert_eq!(SampleRate::from_hz(16000), SampleRate::Hz16000);
        assert_eq!(SampleRate::from_hz(11025), SampleRate::Other(11025));
    }

    #[test]
    fn test_format_byte_math() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.bytes_per_second(), 48000);
        assert_eq!(fmt.bytes_for_ms(50), 2400);
        assert_eq!(fmt.duration_of(48000), Duration::from_secs(1));
    }

    #[test]
    fn test_bytes_for_ms_never_splits_frames() {
        let fmt = AudioFormat {
            sample_rate: SampleRate::Hz22050,
            channels: Channels::Stereo,
            bit_depth: BitDepth::B24,
        };
        let frame = fmt.channels.count() * fmt.bit_depth.bytes();
        assert_eq!(fmt.bytes_for_ms(50) % frame, 0);
    }

    #[test]
    fn test_pcm16_round_trip() {
        let samples = vec![0.0f32, 0.5, -0.5, 0.25];
        let bytes = samples_to_pcm(&samples, BitDepth::B16);
        let back = pcm16_to_samples(&bytes);

        assert_eq!(back.len(), samples.len());
        for (a, b) in samples.iter().zip(back.iter()) {
            assert!((a - b).abs() < 1.0 / 16384.0);
        }
    }

    #[test]
    fn test_pcm_depths_size() {
        let samples = vec![0.1f32; 100];
        assert_eq!(samples_to_pcm(&samples, BitDepth::B8).len(), 100);
        assert_eq!(samples_to_pcm(&samples, BitDepth::B16).len(), 200);
        assert_eq!(samples_to_pcm(&samples, BitDepth::B24).len(), 300);
        assert_eq!(samples_to_pcm(&samples, BitDepth::B32).len(), 400);
    }

    #[test]
    fn test_resample_halves_length() {
        let samples = vec![0.0f32; 2400]; // 100ms at 24kHz
        let out = resample(&samples, SampleRate::Hz24000, SampleRate::Hz16000);
        // FFT resampler may trim to whole chunks; expect within 10% of ideal
        let ideal = 1600.0;
        assert!((out.len() as f64 - ideal).abs() / ideal < 0.1);
    }

    #[test]
    fn test_cross_fade_length_and_ramp() {
        let head = vec![1.0f32; 100];
        let tail = vec![0.0f32; 100];
        let out = cross_fade(&head, &tail, 10);

        assert_eq!(out.len(), 190);
        // Blend region strictly decreasing from head toward tail
        let blend = &out[90..100];
        for w in blend.windows(2) {
            assert!(w[0] > w[1]);
        }
    }

    #[test]
    fn test_cross_fade_zero_is_concat() {
        let head = vec![0.5f32; 10];
        let tail = vec![-0.5f32; 10];
        let out = cross_fade(&head, &tail, 0);
        assert_eq!(out.len(), 20);
        assert_eq!(out[9], 0.5);
        assert_eq!(out[10], -0.5);
    }

    #[test]
    fn test_rms_db() {
        assert!(rms_db(&[0.0; 160]) < -90.0);
        assert!(rms_db(&[0.5; 160]) > -10.0);
    }
}
