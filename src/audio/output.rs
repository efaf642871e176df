//! Sound output seam used by the playback controller.
//!
//! An [`OutputBackend`] opens an [`OutputContext`] (the device); a context
//! starts one [`Voice`] per playback. Contexts are expensive and long-lived,
//! voices are cheap and single-use.

use std::sync::Arc;

use tokio::task::JoinHandle;

use super::pcm::AudioBuffer;
use crate::error::Result;

/// Fired once when a voice reaches the end of its buffer.
///
/// Never fired by [`Voice::stop`] and never from inside
/// [`OutputContext::play`] itself.
pub type EndCallback = Box<dyn FnOnce() + Send + 'static>;

pub trait OutputBackend: Send + Sync {
    /// Opens the output device for buffers of the given shape.
    fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>>;
}

pub trait OutputContext: Send {
    fn is_suspended(&self) -> bool;

    fn resume(&mut self) -> Result<()>;

    /// Starts producing sound for `buffer`.
    fn play(&mut self, buffer: Arc<AudioBuffer>, on_end: EndCallback) -> Result<Box<dyn Voice>>;

    /// Releases the device. Voices still running are cut off.
    fn close(&mut self);
}

/// A single sound-producing handle.
pub trait Voice: Send {
    /// Halts sound immediately. Idempotent.
    fn stop(&mut self);
}

/// Output that produces no sound but keeps real time.
///
/// Each voice sleeps for the buffer's duration on the tokio timer and then
/// reports its end, so playback state behaves as it would on a device.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentOutput;

impl OutputBackend for SilentOutput {
    fn open(&self, sample_rate: u32, channels: u16) -> Result<Box<dyn OutputContext>> {
        log::info!("Silent output opened: rate={}, ch={}", sample_rate, channels);
        Ok(Box::new(SilentContext { voices: Vec::new() }))
    }
}

struct SilentContext {
    voices: Vec<JoinHandle<()>>,
}

impl OutputContext for SilentContext {
    fn is_suspended(&self) -> bool {
        false
    }

    fn resume(&mut self) -> Result<()> {
        Ok(())
    }

    fn play(&mut self, buffer: Arc<AudioBuffer>, on_end: EndCallback) -> Result<Box<dyn Voice>> {
        self.voices.retain(|task| !task.is_finished());
        let duration = buffer.duration();
        let task = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            on_end();
        });
        let abort = task.abort_handle();
        self.voices.push(task);
        Ok(Box::new(SilentVoice { abort }))
    }

    fn close(&mut self) {
        for task in self.voices.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SilentContext {
    fn drop(&mut self) {
        self.close();
    }
}

struct SilentVoice {
    abort: tokio::task::AbortHandle,
}

impl Voice for SilentVoice {
    fn stop(&mut self) {
        self.abort.abort();
    }
}
