//! Memory-only map from finalized message id to decoded speech.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::OnceCell;

use super::pcm::AudioBuffer;
use crate::error::Result;
use crate::message::FinalId;

type Slot = Arc<OnceCell<Arc<AudioBuffer>>>;

/// Speech cache with single-flight fills.
///
/// Concurrent requests for the same id share one fill, so synthesis and
/// decoding run at most once per id. A failed fill leaves no entry behind.
/// `clear` detaches in-flight fills: their result is handed to the caller
/// that started them but never lands in the cleared cache.
#[derive(Debug, Default)]
pub struct SpeechCache {
    slots: Mutex<HashMap<FinalId, Slot>>,
}

impl SpeechCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: FinalId) -> Option<Arc<AudioBuffer>> {
        self.slots().get(&id).and_then(|slot| slot.get().cloned())
    }

    pub fn contains(&self, id: FinalId) -> bool {
        self.get(id).is_some()
    }

    /// Number of decoded entries; fills still in flight are not counted.
    pub fn len(&self) -> usize {
        self.slots().values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.slots().clear();
    }

    pub fn remove(&self, id: FinalId) {
        self.slots().remove(&id);
    }

    /// Returns the cached buffer, or runs `fill` once to produce it.
    pub async fn get_or_fill<F, Fut>(&self, id: FinalId, fill: F) -> Result<Arc<AudioBuffer>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AudioBuffer>>,
    {
        let slot = self.slots().entry(id).or_default().clone();

        let result = slot
            .get_or_try_init(|| async { fill().await.map(Arc::new) })
            .await
            .cloned();

        if result.is_err() {
            let mut slots = self.slots();
            if slots.get(&id).is_some_and(|s| Arc::ptr_eq(s, &slot) && !s.initialized()) {
                slots.remove(&id);
            }
        }
        result
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<FinalId, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::pcm::bytes_to_audio_buffer;
    use crate::error::ChatError;
    use crate::message::MessageLog;
    use std::num::NonZeroU16;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ids(n: usize) -> Vec<FinalId> {
        let mut log = MessageLog::seeded("w");
        for i in 0..n {
            log.push_user(i.to_string());
        }
        log.messages().iter().filter_map(|m| m.id().final_id()).collect()
    }

    fn buffer() -> AudioBuffer {
        bytes_to_audio_buffer(&[0, 0, 0, 64], 24_000, NonZeroU16::new(1).unwrap())
    }

    #[tokio::test]
    async fn fill_runs_once_per_id() {
        let cache = SpeechCache::new();
        let id = ids(0)[0];
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        for _ in 0..3 {
            cache
                .get_or_fill(id, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(buffer())
                })
                .await
                .unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_fills_share_one_call() {
        let cache = SpeechCache::new();
        let id = ids(0)[0];
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let fill = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(buffer())
        };

        let (a, b) = tokio::join!(cache.get_or_fill(id, fill), cache.get_or_fill(id, fill));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fill_leaves_no_entry_and_can_retry() {
        let cache = SpeechCache::new();
        let id = ids(0)[0];

        let err = cache
            .get_or_fill(id, || async { Err(ChatError::Transport("down".into())) })
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::Transport("down".into()));
        assert!(cache.is_empty());
        assert!(!cache.contains(id));

        cache.get_or_fill(id, || async { Ok(buffer()) }).await.unwrap();
        assert!(cache.contains(id));
    }

    #[tokio::test]
    async fn clear_empties_every_entry() {
        let cache = SpeechCache::new();
        for id in ids(2) {
            cache.get_or_fill(id, || async { Ok(buffer()) }).await.unwrap();
        }
        assert_eq!(cache.len(), 3);
        cache.clear();
        assert!(cache.is_empty());
    }
}
