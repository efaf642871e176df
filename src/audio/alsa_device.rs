//! ALSA playback: a dedicated thread owning the PCM device.
//!
//! Uses std::thread (NOT tokio tasks) for real-time audio I/O, fed through a
//! channel, as the device write calls block.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use alsa::pcm::{Access, Format, HwParams, IO, PCM, State};
use alsa::{Direction, ValueOr};
use anyhow::Context;
use tokio::sync::mpsc;

use super::output::{EndCallback, OutputBackend, OutputContext, Voice};
use super::pcm::AudioBuffer;
use crate::error::{ChatError, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone, Copy)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    /// Actual number of channels
    pub channels: u32,
    /// Period size in frames
    pub period_size: usize,
}

/// Open a PCM device for playback.
pub fn open_playback(
    device: &str,
    sample_rate: u32,
    channels: u32,
    period_size: Option<usize>,
) -> anyhow::Result<(PCM, AlsaParams)> {
    let pcm = PCM::new(device, Direction::Playback, false)
        .with_context(|| format!("Failed to open PCM device '{}' for Playback", device))?;

    {
        let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::S16LE)?;
        hwp.set_channels(channels)?;
        hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
        if let Some(ps) = period_size {
            hwp.set_period_size_near(ps as alsa::pcm::Frames, ValueOr::Nearest)?;
        }
        pcm.hw_params(&hwp)?;
    }

    // Read back actual negotiated parameters
    let params = {
        let hwp = pcm.hw_params_current()?;
        AlsaParams {
            sample_rate: hwp.get_rate()?,
            channels: hwp.get_channels()?,
            period_size: hwp.get_period_size()? as usize,
        }
    };

    log::info!(
        "ALSA Playback: device={}, rate={}, channels={}, period_size={}",
        device,
        params.sample_rate,
        params.channels,
        params.period_size,
    );

    Ok((pcm, params))
}

/// Backend that plays through an ALSA device such as "default" or "plughw:0,0".
#[derive(Debug, Clone)]
pub struct AlsaOutput {
    device: String,
    period_size: Option<usize>,
}

impl AlsaOutput {
    /// `period_size` of 0 lets ALSA decide.
    pub fn new(device: impl Into<String>, period_size: usize) -> Self {
        Self {
            device: device.into(),
            period_size: (period_size > 0).then_some(period_size),
        }
    }
}

enum PlayCommand {
    Play {
        samples: Vec<i16>,
        stop: Arc<AtomicBool>,
        on_end: EndCallback,
    },
    Resume,
}

impl OutputBackend for AlsaOutput {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>> {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let suspended = Arc::new(AtomicBool::new(false));

        let device = self.device.clone();
        let period_size = self.period_size;
        let thread_suspended = suspended.clone();
        let handle = thread::Builder::new()
            .name("audio-play".into())
            .spawn(move || {
                let (pcm, params) =
                    match open_playback(&device, sample_rate, channels as u32, period_size) {
                        Ok(opened) => opened,
                        Err(e) => {
                            let _ = ready_tx.send(Err(format!("{:#}", e)));
                            return;
                        }
                    };
                let _ = ready_tx.send(Ok(params));
                if let Err(e) = play_thread(&pcm, params, cmd_rx, &thread_suspended) {
                    log::error!("Playback thread error: {:#}", e);
                }
            })
            .map_err(|e| ChatError::AudioOutput(e.to_string()))?;

        let params = ready_rx
            .recv()
            .map_err(|_| ChatError::AudioOutput("playback thread exited during open".into()))?
            .map_err(ChatError::AudioOutput)?;

        Ok(Box::new(AlsaContext {
            params,
            commands: Some(cmd_tx),
            suspended,
            current: None,
            thread: Some(handle),
        }))
    }
}

struct AlsaContext {
    params: AlsaParams,
    commands: Option<mpsc::UnboundedSender<PlayCommand>>,
    suspended: Arc<AtomicBool>,
    current: Option<Arc<AtomicBool>>,
    thread: Option<JoinHandle<()>>,
}

impl AlsaContext {
    fn send(&self, cmd: PlayCommand) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or_else(|| ChatError::AudioOutput("output already closed".into()))?
            .send(cmd)
            .map_err(|_| ChatError::AudioOutput("playback thread is gone".into()))
    }
}

impl OutputContext for AlsaContext {
    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }

    fn resume(&mut self) -> Result<()> {
        self.send(PlayCommand::Resume)?;
        self.suspended.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn play(&mut self, buffer: Arc<AudioBuffer>, on_end: EndCallback) -> Result<Box<dyn Voice>> {
        let samples = conform(&buffer, self.params);
        let stop = Arc::new(AtomicBool::new(false));
        self.send(PlayCommand::Play {
            samples,
            stop: stop.clone(),
            on_end,
        })?;
        self.current = Some(stop.clone());
        Ok(Box::new(AlsaVoice { stop }))
    }

    fn close(&mut self) {
        if let Some(stop) = self.current.take() {
            stop.store(true, Ordering::SeqCst);
        }
        // Dropping the sender ends the thread's receive loop
        self.commands.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for AlsaContext {
    fn drop(&mut self) {
        self.close();
    }
}

struct AlsaVoice {
    stop: Arc<AtomicBool>,
}

impl Voice for AlsaVoice {
    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// Matches a decoded buffer to the negotiated device rate and channel count.
fn conform(buffer: &AudioBuffer, params: AlsaParams) -> Vec<i16> {
    let channels = params.channels as usize;
    let interleaved = buffer.interleaved_i16(channels);
    if buffer.sample_rate() == params.sample_rate || buffer.sample_rate() == 0 {
        return interleaved;
    }

    // Nearest-frame resampling; the plug layer normally makes this a no-op
    let in_frames = buffer.frames();
    let out_frames =
        (in_frames as u64 * params.sample_rate as u64 / buffer.sample_rate() as u64) as usize;
    let mut out = Vec::with_capacity(out_frames * channels);
    for frame in 0..out_frames {
        let src = (frame as u64 * buffer.sample_rate() as u64 / params.sample_rate as u64) as usize;
        let src = src.min(in_frames.saturating_sub(1));
        out.extend_from_slice(&interleaved[src * channels..(src + 1) * channels]);
    }
    out
}

fn play_thread(
    pcm: &PCM,
    params: AlsaParams,
    mut commands: mpsc::UnboundedReceiver<PlayCommand>,
    suspended: &AtomicBool,
) -> anyhow::Result<()> {
    let io = pcm.io_i16()?;

    while let Some(cmd) = commands.blocking_recv() {
        match cmd {
            PlayCommand::Resume => {
                if pcm.state() == State::Suspended {
                    log::info!("Resuming suspended playback device");
                    if pcm.resume().is_err() {
                        pcm.prepare()?;
                    }
                }
            }
            PlayCommand::Play {
                samples,
                stop,
                on_end,
            } => {
                let finished = write_samples(pcm, &io, params, &samples, &stop);
                if finished {
                    on_end();
                } else {
                    // Discard whatever is still queued in the device
                    let _ = pcm.drop();
                    let _ = pcm.prepare();
                }
            }
        }
        suspended.store(pcm.state() == State::Suspended, Ordering::SeqCst);
    }

    log::info!("Playback channel closed");
    Ok(())
}

/// Writes period-sized chunks until done or stopped; true if played to the end.
fn write_samples(
    pcm: &PCM,
    io: &IO<i16>,
    params: AlsaParams,
    samples: &[i16],
    stop: &AtomicBool,
) -> bool {
    let channels = params.channels as usize;
    let total_frames = samples.len() / channels;
    let chunk_frames = params.period_size.max(1);
    let mut frames_written = 0;
    let mut retry_count = 0u32;

    while frames_written < total_frames {
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        let end = (frames_written + chunk_frames).min(total_frames);
        match io.writei(&samples[frames_written * channels..end * channels]) {
            Ok(n) => {
                frames_written += n;
                retry_count = 0;
            }
            Err(e) => {
                log::warn!("ALSA XRUN or error: {}, recovering...", e);
                retry_count += 1;
                if let Err(e2) = pcm.prepare() {
                    log::error!("Failed to recover PCM playback: {}", e2);
                    return false;
                }
                if retry_count >= 3 {
                    log::error!(
                        "Max recovery retries ({}) reached. Dropping {} unwritten frames.",
                        retry_count,
                        total_frames - frames_written
                    );
                    break;
                }
            }
        }
    }

    // Wait for the device queue to empty while staying interruptible
    while let Ok(delay) = pcm.delay() {
        if delay <= 0 {
            break;
        }
        if stop.load(Ordering::SeqCst) {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    !stop.load(Ordering::SeqCst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::bytes_to_audio_buffer;
    use std::num::NonZeroU16;

    fn mono(bytes: &[u8], sample_rate: u32) -> AudioBuffer {
        bytes_to_audio_buffer(bytes, sample_rate, NonZeroU16::new(1).unwrap())
    }

    fn params(sample_rate: u32, channels: u32) -> AlsaParams {
        AlsaParams {
            sample_rate,
            channels,
            period_size: 1024,
        }
    }

    #[test]
    fn matching_rate_is_only_interleaved() {
        // 16384, -16384 at 24 kHz mono
        let buffer = mono(&[0x00, 0x40, 0x00, 0xc0], 24_000);
        assert_eq!(conform(&buffer, params(24_000, 1)), vec![16384, -16384]);
    }

    #[test]
    fn doubling_the_rate_repeats_each_frame() {
        let buffer = mono(&[0x00, 0x40, 0x00, 0xc0], 24_000);
        assert_eq!(
            conform(&buffer, params(48_000, 2)),
            vec![16384, 16384, 16384, 16384, -16384, -16384, -16384, -16384]
        );
    }

    #[test]
    fn halving_the_rate_keeps_every_other_frame() {
        let bytes = [0x00, 0x10, 0x00, 0x20, 0x00, 0x30, 0x00, 0x40];
        let buffer = mono(&bytes, 48_000);
        assert_eq!(conform(&buffer, params(24_000, 1)), vec![0x1000, 0x3000]);
    }
}
