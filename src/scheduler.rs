use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::error::DownloadError;
use crate::pipeline::Pipeline;
use crate::source::SourceClient;
use crate::store::ArtifactStore;

#[derive(Default)]
struct PassState {
    running: bool,
    pending: bool,
}

/// Drives discovery passes: list the remote catalog, diff against the local
/// store, and download every missing chapter in ascending order. Passes
/// never overlap; triggers that arrive while one runs collapse into a
/// single follow-up pass.
pub struct DiscoveryScheduler {
    source: Arc<dyn SourceClient>,
    store: Arc<ArtifactStore>,
    pipeline: Arc<Pipeline>,
    state: Mutex<PassState>,
    /// Bounds how many chapter downloads one pass runs concurrently.
    permits: Arc<Semaphore>,
}

impl DiscoveryScheduler {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<ArtifactStore>,
        pipeline: Arc<Pipeline>,
        parallelism: usize,
    ) -> Self {
        Self {
            source,
            store,
            pipeline,
            state: Mutex::new(PassState::default()),
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    /// Requests a discovery pass. Returns true if a pass was started,
    /// false if one is already running (in which case exactly one
    /// follow-up pass is queued, no matter how many triggers arrive).
    pub fn trigger(self: &Arc<Self>) -> bool {
        {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.running {
                state.pending = true;
                return false;
            }
            state.running = true;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run_passes().await });
        true
    }

    /// Spawns the periodic trigger loop.
    pub fn spawn_interval(self: &Arc<Self>, every: Duration) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.trigger();
            }
        });
    }

    async fn run_passes(self: Arc<Self>) {
        loop {
            self.run_pass().await;
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(poisoned) => poisoned.into_inner(),
            };
            if state.pending {
                state.pending = false;
                continue;
            }
            state.running = false;
            return;
        }
    }

    async fn run_pass(&self) {
        let listing = match self.source.list_available_chapters().await {
            Ok(listing) => listing,
            Err(err) => {
                tracing::warn!(%err, "discovery pass aborted: listing failed");
                return;
            }
        };

        let mut missing = Vec::new();
        for chapter in &listing {
            if chapter.available && !self.store.contains(chapter.number).await {
                missing.push(chapter.number);
            }
        }
        missing.sort_unstable();
        if missing.is_empty() {
            tracing::debug!(known = listing.len(), "discovery pass: catalog up to date");
            return;
        }
        tracing::info!(
            missing = missing.len(),
            first = missing.first(),
            last = missing.last(),
            "discovery pass found new chapters"
        );

        // Acquire a permit before spawning so downloads start in ascending
        // chapter order even though they run in parallel.
        let mut handles = Vec::with_capacity(missing.len());
        for number in missing {
            let permit = match Arc::clone(&self.permits).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let pipeline = Arc::clone(&self.pipeline);
            handles.push(tokio::spawn(async move {
                let result = pipeline.download_chapter(number).await;
                drop(permit);
                (number, result)
            }));
        }

        for handle in handles {
            match handle.await {
                Ok((_, Ok(_))) => {}
                Ok((number, Err(DownloadError::ChapterNotAvailable(_)))) => {
                    tracing::debug!(chapter = number, "chapter vanished between listing and fetch");
                }
                Ok((number, Err(err))) => {
                    tracing::warn!(chapter = number, %err, "scheduled download failed");
                }
                Err(err) => {
                    tracing::warn!(%err, "scheduled download panicked");
                }
            }
        }
    }
}
