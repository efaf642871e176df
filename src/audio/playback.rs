//! Speaks finalized replies: at most one at a time, toggled per message.

use std::num::NonZeroU16;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

use super::cache::SpeechCache;
use super::output::{OutputBackend, OutputContext, Voice};
use super::pcm::decode_payload;
use crate::error::{ChatError, Result};
use crate::gateway::SynthesisGateway;
use crate::message::FinalId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    /// Synthesizing or decoding speech for this message.
    Loading(FinalId),
    Playing(FinalId),
}

impl PlaybackState {
    /// The message currently loading or playing, if any.
    pub fn message(&self) -> Option<FinalId> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Loading(id) | PlaybackState::Playing(id) => Some(*id),
        }
    }
}

/// What a call to [`PlaybackController::request_playback`] ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Sound started for the requested message.
    Started,
    /// The message was playing; it is now stopped.
    Stopped,
    /// Speech for the message is already being prepared.
    AlreadyLoading,
    /// Another request or a stop arrived while this one was loading.
    Superseded,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    StateChanged(PlaybackState),
    Failed { id: FinalId, error: ChatError },
}

struct Inner {
    state: PlaybackState,
    /// Bumped by every request and stop; stale loads and end callbacks compare against it.
    generation: u64,
    voice: Option<Box<dyn Voice>>,
    context: Option<Box<dyn OutputContext>>,
    events: Option<mpsc::UnboundedSender<PlaybackEvent>>,
}

impl Inner {
    fn set_state(&mut self, state: PlaybackState) {
        if self.state == state {
            return;
        }
        log::debug!("Playback: {:?} -> {:?}", self.state, state);
        self.state = state;
        self.emit(PlaybackEvent::StateChanged(state));
    }

    fn emit(&mut self, event: PlaybackEvent) {
        if let Some(tx) = &self.events {
            if tx.send(event).is_err() {
                self.events = None;
            }
        }
    }

    /// Cuts any sound, invalidates pending loads and returns to idle.
    fn halt(&mut self) {
        if let Some(mut voice) = self.voice.take() {
            voice.stop();
        }
        self.generation += 1;
        self.set_state(PlaybackState::Idle);
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct PlaybackController {
    synth: Arc<dyn SynthesisGateway>,
    backend: Arc<dyn OutputBackend>,
    sample_rate: u32,
    channels: NonZeroU16,
    cache: SpeechCache,
    inner: Arc<Mutex<Inner>>,
}

impl PlaybackController {
    pub fn new(
        synth: Arc<dyn SynthesisGateway>,
        backend: Arc<dyn OutputBackend>,
        sample_rate: u32,
        channels: NonZeroU16,
    ) -> Self {
        Self {
            synth,
            backend,
            sample_rate,
            channels,
            cache: SpeechCache::new(),
            inner: Arc::new(Mutex::new(Inner {
                state: PlaybackState::Idle,
                generation: 0,
                voice: None,
                context: None,
                events: None,
            })),
        }
    }

    /// Routes state changes and failures to the returned receiver.
    ///
    /// Only the latest subscriber receives events.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<PlaybackEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).events = Some(tx);
        rx
    }

    pub fn state(&self) -> PlaybackState {
        lock(&self.inner).state
    }

    pub fn cache(&self) -> &SpeechCache {
        &self.cache
    }

    /// Toggles speech for a finalized message.
    ///
    /// Playing the same message stops it; any other message playing is cut
    /// off first. Speech is synthesized on first use and cached by id, so a
    /// message is synthesized at most once until the next [`reset`].
    ///
    /// [`reset`]: PlaybackController::reset
    pub async fn request_playback(&self, id: FinalId, text: &str) -> Result<PlaybackOutcome> {
        let generation = {
            let mut inner = lock(&self.inner);
            match inner.state {
                PlaybackState::Playing(current) if current == id => {
                    inner.halt();
                    return Ok(PlaybackOutcome::Stopped);
                }
                PlaybackState::Loading(current) if current == id => {
                    return Ok(PlaybackOutcome::AlreadyLoading);
                }
                _ => {}
            }

            inner.halt();
            inner.set_state(PlaybackState::Loading(id));
            inner.generation
        };

        if let Err(e) = self.ensure_context().await {
            log::warn!("Audio output unavailable: {}", e);
            let mut inner = lock(&self.inner);
            if inner.generation == generation {
                inner.set_state(PlaybackState::Idle);
            }
            inner.emit(PlaybackEvent::Failed { id, error: e.clone() });
            return Err(e);
        }

        let synth = self.synth.clone();
        let (sample_rate, channels) = (self.sample_rate, self.channels);
        let filled = self
            .cache
            .get_or_fill(id, || async move {
                let payload = synth.synthesize(text).await?;
                decode_payload(&payload, sample_rate, channels)
            })
            .await;

        let mut inner = lock(&self.inner);
        let buffer = match filled {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Speech for message {} failed: {}", id, e);
                if inner.generation == generation {
                    inner.set_state(PlaybackState::Idle);
                    inner.emit(PlaybackEvent::Failed { id, error: e.clone() });
                }
                return Err(e);
            }
        };

        if inner.generation != generation {
            log::debug!("Playback of {} superseded while loading", id);
            return Ok(PlaybackOutcome::Superseded);
        }

        let on_end = end_callback(Arc::downgrade(&self.inner), generation, id);
        let played = match inner.context.as_mut() {
            Some(context) => context.play(buffer, on_end),
            None => Err(ChatError::AudioOutput("output closed".into())),
        };
        match played {
            Ok(voice) => {
                inner.voice = Some(voice);
                inner.set_state(PlaybackState::Playing(id));
                Ok(PlaybackOutcome::Started)
            }
            Err(e) => {
                log::warn!("Could not start playback of {}: {}", id, e);
                inner.set_state(PlaybackState::Idle);
                inner.emit(PlaybackEvent::Failed { id, error: e.clone() });
                Err(e)
            }
        }
    }

    /// Silences any playback and abandons pending loads. Safe in any state.
    pub fn stop(&self) {
        lock(&self.inner).halt();
    }

    /// Stops playback and forgets every cached speech buffer.
    pub fn reset(&self) {
        self.stop();
        self.cache.clear();
        log::info!("Speech cache cleared");
    }

    /// Stops playback and releases the output device.
    pub fn shutdown(&self) {
        // Closing may wait on an end callback that needs the lock
        let context = {
            let mut inner = lock(&self.inner);
            inner.halt();
            inner.context.take()
        };
        if let Some(mut context) = context {
            context.close();
            log::info!("Audio output released");
        }
    }

    /// Opens the output on first use and resumes it if suspended.
    ///
    /// Opening can block on the device, so it runs off the async worker and
    /// without the state lock held.
    async fn ensure_context(&self) -> Result<()> {
        let missing = lock(&self.inner).context.is_none();
        if missing {
            let backend = self.backend.clone();
            let (sample_rate, channels) = (self.sample_rate, self.channels.get());
            let opened = tokio::task::spawn_blocking(move || backend.open(sample_rate, channels))
                .await
                .map_err(|e| ChatError::AudioOutput(format!("output open task failed: {}", e)))??;

            // A concurrent request may have opened one meanwhile; keep the first
            let spare = {
                let mut inner = lock(&self.inner);
                match inner.context {
                    Some(_) => Some(opened),
                    None => {
                        inner.context = Some(opened);
                        None
                    }
                }
            };
            if let Some(mut spare) = spare {
                spare.close();
            }
        }

        let mut inner = lock(&self.inner);
        if let Some(context) = inner.context.as_mut() {
            if context.is_suspended() {
                context.resume()?;
            }
        }
        Ok(())
    }

    /// Forgets the speech of a message that no longer exists, silencing it if audible.
    pub fn discard(&self, id: FinalId) {
        {
            let mut inner = lock(&self.inner);
            if inner.state.message() == Some(id) {
                inner.halt();
            }
        }
        self.cache.remove(id);
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn end_callback(inner: Weak<Mutex<Inner>>, generation: u64, id: FinalId) -> Box<dyn FnOnce() + Send> {
    Box::new(move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let mut inner = lock(&inner);
        if inner.generation == generation && inner.state == PlaybackState::Playing(id) {
            inner.voice = None;
            inner.set_state(PlaybackState::Idle);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::output::EndCallback;
    use crate::audio::pcm::AudioBuffer;
    use crate::message::MessageLog;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    /// Synthesizer counting its calls, optionally held until released.
    #[derive(Default)]
    struct CountingSynth {
        calls: AtomicUsize,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    #[async_trait]
    impl SynthesisGateway for CountingSynth {
        async fn synthesize(&self, _text: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(ChatError::Transport("tts down".into()));
            }
            // Two samples of silence
            Ok("AAAAAA==".into())
        }
    }

    /// Output whose voices end only when the test says so.
    #[derive(Default)]
    struct ManualOutput {
        opened: AtomicUsize,
        voices: Arc<Mutex<Vec<(Option<EndCallback>, Arc<AtomicBool>)>>>,
    }

    impl ManualOutput {
        fn finish(&self, index: usize) {
            let callback = self.voices.lock().unwrap()[index].0.take();
            if let Some(callback) = callback {
                callback();
            }
        }

        fn stopped(&self, index: usize) -> bool {
            self.voices.lock().unwrap()[index].1.load(Ordering::SeqCst)
        }

        fn voice_count(&self) -> usize {
            self.voices.lock().unwrap().len()
        }
    }

    impl OutputBackend for ManualOutput {
        fn open(&self, _sample_rate: u32, _channels: u16) -> Result<Box<dyn OutputContext>> {
            self.opened.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(ManualContext {
                voices: self.voices.clone(),
            }))
        }
    }

    struct ManualContext {
        voices: Arc<Mutex<Vec<(Option<EndCallback>, Arc<AtomicBool>)>>>,
    }

    impl OutputContext for ManualContext {
        fn is_suspended(&self) -> bool {
            false
        }

        fn resume(&mut self) -> Result<()> {
            Ok(())
        }

        fn play(&mut self, _buffer: Arc<AudioBuffer>, on_end: EndCallback) -> Result<Box<dyn Voice>> {
            let stopped = Arc::new(AtomicBool::new(false));
            self.voices.lock().unwrap().push((Some(on_end), stopped.clone()));
            Ok(Box::new(ManualVoice { stopped }))
        }

        /// Fires any pending end from a device thread and joins it, as ALSA does.
        fn close(&mut self) {
            let pending: Vec<EndCallback> = self
                .voices
                .lock()
                .unwrap()
                .iter_mut()
                .filter_map(|(callback, _)| callback.take())
                .collect();
            std::thread::spawn(move || pending.into_iter().for_each(|callback| callback()))
                .join()
                .unwrap();
        }
    }

    struct ManualVoice {
        stopped: Arc<AtomicBool>,
    }

    impl Voice for ManualVoice {
        fn stop(&mut self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn ids(n: usize) -> Vec<FinalId> {
        let mut log = MessageLog::seeded("w");
        for i in 1..n {
            log.push_user(i.to_string());
        }
        log.messages().iter().filter_map(|m| m.id().final_id()).collect()
    }

    fn controller(synth: Arc<CountingSynth>, output: Arc<ManualOutput>) -> Arc<PlaybackController> {
        Arc::new(PlaybackController::new(
            synth,
            output,
            24_000,
            NonZeroU16::new(1).unwrap(),
        ))
    }

    #[tokio::test]
    async fn request_plays_then_returns_to_idle_at_the_end() {
        let synth = Arc::new(CountingSynth::default());
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let mut events = playback.subscribe();
        let id = ids(1)[0];

        assert_eq!(playback.request_playback(id, "ciao").await.unwrap(), PlaybackOutcome::Started);
        assert_eq!(playback.state(), PlaybackState::Playing(id));
        assert!(playback.cache().contains(id));

        output.finish(0);
        assert_eq!(playback.state(), PlaybackState::Idle);

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert_eq!(
            seen,
            vec![
                PlaybackEvent::StateChanged(PlaybackState::Loading(id)),
                PlaybackEvent::StateChanged(PlaybackState::Playing(id)),
                PlaybackEvent::StateChanged(PlaybackState::Idle),
            ]
        );
    }

    #[tokio::test]
    async fn second_request_for_the_same_message_stops_it() {
        let synth = Arc::new(CountingSynth::default());
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let id = ids(1)[0];

        playback.request_playback(id, "ciao").await.unwrap();
        assert_eq!(playback.request_playback(id, "ciao").await.unwrap(), PlaybackOutcome::Stopped);
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(output.stopped(0));

        // A late end from the stopped voice changes nothing
        output.finish(0);
        assert_eq!(playback.state(), PlaybackState::Idle);
    }

    #[tokio::test]
    async fn replay_uses_the_cache_and_the_same_context() {
        let synth = Arc::new(CountingSynth::default());
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let id = ids(1)[0];

        playback.request_playback(id, "ciao").await.unwrap();
        output.finish(0);
        playback.request_playback(id, "ciao").await.unwrap();

        assert_eq!(synth.calls.load(Ordering::SeqCst), 1);
        assert_eq!(output.opened.load(Ordering::SeqCst), 1);
        assert_eq!(output.voice_count(), 2);
    }

    #[tokio::test]
    async fn another_message_cuts_off_the_one_playing() {
        let synth = Arc::new(CountingSynth::default());
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let ids = ids(2);

        playback.request_playback(ids[0], "uno").await.unwrap();
        playback.request_playback(ids[1], "due").await.unwrap();

        assert!(output.stopped(0));
        assert_eq!(playback.state(), PlaybackState::Playing(ids[1]));
        // The first voice ending late does not disturb the second
        output.finish(0);
        assert_eq!(playback.state(), PlaybackState::Playing(ids[1]));
    }

    #[tokio::test]
    async fn synthesis_failure_returns_to_idle_and_reports() {
        let synth = Arc::new(CountingSynth::default());
        synth.fail.store(true, Ordering::SeqCst);
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let mut events = playback.subscribe();
        let id = ids(1)[0];

        let err = playback.request_playback(id, "ciao").await.unwrap_err();
        assert_eq!(err, ChatError::Transport("tts down".into()));
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(!playback.cache().contains(id));
        assert_eq!(output.voice_count(), 0);

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, PlaybackEvent::Failed { id: f, .. } if f == id);
        }
        assert!(failed);
    }

    #[tokio::test]
    async fn stop_while_loading_discards_the_late_buffer() {
        let gate = Arc::new(Notify::new());
        let synth = Arc::new(CountingSynth {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let id = ids(1)[0];

        let task = tokio::spawn({
            let playback = playback.clone();
            async move { playback.request_playback(id, "ciao").await }
        });
        while playback.state() != PlaybackState::Loading(id) {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            playback.request_playback(id, "ciao").await.unwrap(),
            PlaybackOutcome::AlreadyLoading
        );

        playback.stop();
        gate.notify_one();
        assert_eq!(task.await.unwrap().unwrap(), PlaybackOutcome::Superseded);
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert_eq!(output.voice_count(), 0);
        // The speech itself is still cached for next time
        assert!(playback.cache().contains(id));
    }

    #[tokio::test]
    async fn reset_stops_and_empties_the_cache() {
        let synth = Arc::new(CountingSynth::default());
        let output = Arc::new(ManualOutput::default());
        let playback = controller(synth.clone(), output.clone());
        let id = ids(1)[0];

        playback.request_playback(id, "ciao").await.unwrap();
        playback.reset();
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(output.stopped(0));
        assert!(playback.cache().is_empty());

        playback.request_playback(id, "ciao").await.unwrap();
        assert_eq!(synth.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_completes_while_the_device_reports_an_end() {
        let output = Arc::new(ManualOutput::default());
        let playback = controller(Arc::new(CountingSynth::default()), output.clone());
        let id = ids(1)[0];
        playback.request_playback(id, "ciao").await.unwrap();

        let closing = tokio::task::spawn_blocking({
            let playback = playback.clone();
            move || playback.shutdown()
        });
        tokio::time::timeout(Duration::from_secs(5), closing)
            .await
            .expect("shutdown did not return")
            .unwrap();
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(output.stopped(0));

        // The next request opens a fresh output
        playback.request_playback(id, "ciao").await.unwrap();
        assert_eq!(output.opened.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn discard_silences_and_forgets_one_message() {
        let output = Arc::new(ManualOutput::default());
        let playback = controller(Arc::new(CountingSynth::default()), output.clone());
        let ids = ids(2);
        playback.request_playback(ids[0], "uno").await.unwrap();
        output.finish(0);
        playback.request_playback(ids[1], "due").await.unwrap();

        playback.discard(ids[0]);
        assert_eq!(playback.state(), PlaybackState::Playing(ids[1]));
        assert!(!playback.cache().contains(ids[0]));

        playback.discard(ids[1]);
        assert_eq!(playback.state(), PlaybackState::Idle);
        assert!(output.stopped(1));
        assert!(playback.cache().is_empty());
    }

    #[test]
    fn stop_is_harmless_when_idle() {
        let playback = controller(
            Arc::new(CountingSynth::default()),
            Arc::new(ManualOutput::default()),
        );
        playback.stop();
        playback.shutdown();
        assert_eq!(playback.state(), PlaybackState::Idle);
    }
}
