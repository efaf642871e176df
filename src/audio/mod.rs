//! audio - Speech decoding, caching and playback
//!
//! Synthesized speech arrives as base64 PCM, is decoded once per message
//! into an [`AudioBuffer`] and played through an [`OutputBackend`]. With the
//! `alsa` feature the backend is a real ALSA device; otherwise the silent
//! backend keeps time without producing sound.

#[cfg(feature = "alsa")]
mod alsa_device;
mod cache;
mod output;
mod pcm;
mod playback;

#[cfg(feature = "alsa")]
pub use alsa_device::AlsaOutput;
pub use cache::SpeechCache;
pub use output::{EndCallback, OutputBackend, OutputContext, SilentOutput, Voice};
pub use pcm::{AudioBuffer, bytes_to_audio_buffer, decode_base64_to_bytes, decode_payload};
pub use playback::{PlaybackController, PlaybackEvent, PlaybackOutcome, PlaybackState};
