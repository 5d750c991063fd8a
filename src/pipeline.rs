use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sha2::Digest as _;
use tokio::sync::Mutex;

use crate::epub::{self, ChapterMeta};
use crate::error::DownloadError;
use crate::notify::{NotificationEvent, Notifier};
use crate::source::SourceClient;
use crate::store::{ArtifactStore, DownloadedChapter};

/// Fetch-and-assemble pipeline. `download_chapter` is idempotent and
/// collapses concurrent requests for the same chapter into one download:
/// the in-flight map holds a per-chapter lock that late arrivals wait on,
/// after which they find the committed record on the fast path.
pub struct Pipeline {
    source: Arc<dyn SourceClient>,
    store: Arc<ArtifactStore>,
    notifier: Arc<Notifier>,
    inflight: Mutex<HashMap<u32, Arc<Mutex<()>>>>,
    /// Base for the download link embedded in notification events.
    public_base_url: String,
}

impl Pipeline {
    pub fn new(
        source: Arc<dyn SourceClient>,
        store: Arc<ArtifactStore>,
        notifier: Arc<Notifier>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            source,
            store,
            notifier,
            inflight: Mutex::new(HashMap::new()),
            public_base_url: public_base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub async fn download_chapter(&self, number: u32) -> Result<DownloadedChapter, DownloadError> {
        loop {
            if let Some(record) = self.store.get(number).await {
                return Ok(record);
            }

            // The leader locks its slot before publishing it, so waiters can
            // never sneak in between insert and lock.
            let (slot, guard) = {
                let mut inflight = self.inflight.lock().await;
                match inflight.get(&number) {
                    Some(slot) => (Arc::clone(slot), None),
                    None => {
                        let slot = Arc::new(Mutex::new(()));
                        let guard = Arc::clone(&slot).try_lock_owned().ok();
                        inflight.insert(number, Arc::clone(&slot));
                        (slot, guard)
                    }
                }
            };

            let Some(_guard) = guard else {
                // Wait for the current download to finish, then start over
                // from the store lookup. A committed record is returned on
                // the fast path; after a failed download one waiter becomes
                // the next leader and retries.
                drop(slot.lock().await);
                continue;
            };

            let result = self.fetch_and_commit(number).await;
            self.release_slot(number, &slot).await;

            return match result {
                Ok(record) => {
                    self.emit_event(&record);
                    Ok(record)
                }
                Err(err) => {
                    tracing::warn!(chapter = number, %err, "chapter download failed");
                    Err(err)
                }
            };
        }
    }

    /// Removes the in-flight entry, but only if it is still this leader's
    /// slot; a successor that already replaced it is left alone.
    async fn release_slot(&self, number: u32, slot: &Arc<Mutex<()>>) {
        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(&number)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            inflight.remove(&number);
        }
    }

    async fn fetch_and_commit(&self, number: u32) -> Result<DownloadedChapter, DownloadError> {
        let listing = self.source.list_available_chapters().await?;
        let chapter = listing
            .into_iter()
            .find(|c| c.number == number && c.available)
            .ok_or(DownloadError::ChapterNotAvailable(number))?;

        tracing::info!(chapter = number, pages = chapter.page_count, "downloading chapter");
        let pages = self.source.fetch_page_assets(number).await?;

        // The artifact must be byte-complete: every declared page, indices
        // contiguous from zero.
        if pages.len() as u32 != chapter.page_count {
            return Err(DownloadError::IncompletePageSet {
                chapter: number,
                expected: chapter.page_count,
                actual: pages.len() as u32,
            });
        }
        for (i, page) in pages.iter().enumerate() {
            if page.page_index != i as u32 {
                return Err(DownloadError::IncompletePageSet {
                    chapter: number,
                    expected: chapter.page_count,
                    actual: pages.len() as u32,
                });
            }
        }

        let final_path = self.store.artifact_path(number);
        let tmp_path =
            final_path.with_extension(format!("epub.tmp.{}", uuid::Uuid::new_v4().simple()));
        if let Some(parent) = tmp_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                DownloadError::Store(format!("create {}: {err}", parent.display()))
            })?;
        }

        let meta = ChapterMeta {
            number,
            title: chapter.title.clone(),
            language: "de".to_string(),
        };
        let assemble_result = {
            let tmp_path = tmp_path.clone();
            tokio::task::spawn_blocking(move || epub::assemble(&meta, &pages, &tmp_path))
                .await
                .map_err(|err| DownloadError::AssemblyFailure(format!("join assembly: {err}")))?
        };
        if let Err(err) = assemble_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        let bytes = tokio::fs::read(&tmp_path)
            .await
            .map_err(|err| DownloadError::AssemblyFailure(format!("read assembled artifact: {err}")))?;
        let record = DownloadedChapter {
            chapter_number: number,
            title: chapter.title,
            page_count: chapter.page_count,
            artifact_path: tmp_path.clone(),
            downloaded_at: Utc::now(),
            size_bytes: bytes.len() as u64,
            sha256: hex::encode(sha2::Sha256::digest(&bytes)),
        };

        self.store.commit(record, &tmp_path).await
    }

    fn emit_event(&self, record: &DownloadedChapter) {
        let event = NotificationEvent {
            chapter_number: record.chapter_number,
            title: record.title.clone(),
            url: format!(
                "{}/api/chapters/{}/epub",
                self.public_base_url, record.chapter_number
            ),
        };
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            notifier.fan_out(&event).await;
        });
    }
}
