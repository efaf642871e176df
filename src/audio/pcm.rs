//! Base64 PCM payloads to playable, normalized sample buffers.

use std::num::NonZeroU16;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;

use crate::error::Result;

/// Decoded audio, one `f32` vector per channel, samples in `[-1.0, 1.0)`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames (samples per channel).
    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Re-interleaves the buffer as i16 PCM for `out_channels` device channels.
    ///
    /// Mono sources are copied to every output channel; extra source
    /// channels beyond the device's are dropped.
    pub fn interleaved_i16(&self, out_channels: usize) -> Vec<i16> {
        let frames = self.frames();
        let mut out = Vec::with_capacity(frames * out_channels);
        for frame in 0..frames {
            for ch in 0..out_channels {
                let src = ch.min(self.channels.len().saturating_sub(1));
                let sample = self.channels.get(src).map_or(0.0, |c| c[frame]);
                out.push((sample * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32) as i16);
            }
        }
        out
    }
}

/// Standard base64 decode; `MalformedPayload` on invalid input.
pub fn decode_base64_to_bytes(payload: &str) -> Result<Vec<u8>> {
    Ok(BASE64_STANDARD.decode(payload.trim())?)
}

/// Interprets `bytes` as interleaved little-endian i16 PCM.
///
/// A trailing odd byte is ignored, as is a final partial frame.
pub fn bytes_to_audio_buffer(bytes: &[u8], sample_rate: u32, channel_count: NonZeroU16) -> AudioBuffer {
    let channel_count = channel_count.get() as usize;
    let even = &bytes[..bytes.len() - bytes.len() % 2];
    let frames = even.len() / 2 / channel_count;

    let mut channels = vec![Vec::with_capacity(frames); channel_count];
    for (i, pair) in even.chunks_exact(2).take(frames * channel_count).enumerate() {
        let sample = i16::from_le_bytes([pair[0], pair[1]]);
        channels[i % channel_count].push(sample as f32 / 32768.0);
    }

    AudioBuffer {
        sample_rate,
        channels,
    }
}

/// Both steps at once, as used on a synthesis result.
pub fn decode_payload(payload: &str, sample_rate: u32, channel_count: NonZeroU16) -> Result<AudioBuffer> {
    let bytes = decode_base64_to_bytes(payload)?;
    Ok(bytes_to_audio_buffer(&bytes, sample_rate, channel_count))
}
