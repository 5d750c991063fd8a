#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Semaphore};

use mangashelf::error::SourceError;
use mangashelf::notify::registry::SubscriberRegistry;
use mangashelf::notify::{EmailChannel, NotificationEvent, Notifier, PushChannel, PushSendError};
use mangashelf::pipeline::Pipeline;
use mangashelf::source::{Chapter, PageAsset, SourceClient};
use mangashelf::store::ArtifactStore;

pub fn chapter(number: u32, pages: u32, available: bool) -> Chapter {
    Chapter {
        number,
        title: format!("Kapitel {number}"),
        published_date: Some("2025-07-01".to_string()),
        page_count: pages,
        available,
    }
}

pub fn page_assets(number: u32, count: u32) -> Vec<PageAsset> {
    (0..count)
        .map(|i| PageAsset {
            chapter_number: number,
            page_index: i,
            media_type: "image/jpeg".to_string(),
            bytes: vec![(number % 251) as u8, i as u8, 0xff],
        })
        .collect()
}

/// Scripted source for pipeline and scheduler tests. Chapters listed with
/// `available: true` also get a matching page set unless overridden.
pub struct ScriptedSource {
    chapters: Mutex<Vec<Chapter>>,
    pages: Mutex<HashMap<u32, Vec<PageAsset>>>,
    pub list_calls: AtomicUsize,
    pub fetch_calls: AtomicUsize,
    pub fetch_order: Mutex<Vec<u32>>,
    pub fail_listing: AtomicBool,
    /// One-shot: the next page fetch fails after passing the gate.
    pub fail_next_fetch: AtomicBool,
    /// When set, every listing call consumes one permit before returning,
    /// so a test can hold a discovery pass open.
    pub listing_gate: Option<Arc<Semaphore>>,
    /// Same, for page fetches.
    pub fetch_gate: Option<Arc<Semaphore>>,
    current_fetches: AtomicUsize,
    pub max_concurrent_fetches: AtomicUsize,
}

impl ScriptedSource {
    pub fn new(chapters: Vec<Chapter>) -> Self {
        let pages = chapters
            .iter()
            .filter(|c| c.available)
            .map(|c| (c.number, page_assets(c.number, c.page_count)))
            .collect();
        Self {
            chapters: Mutex::new(chapters),
            pages: Mutex::new(pages),
            list_calls: AtomicUsize::new(0),
            fetch_calls: AtomicUsize::new(0),
            fetch_order: Mutex::new(Vec::new()),
            fail_listing: AtomicBool::new(false),
            fail_next_fetch: AtomicBool::new(false),
            listing_gate: None,
            fetch_gate: None,
            current_fetches: AtomicUsize::new(0),
            max_concurrent_fetches: AtomicUsize::new(0),
        }
    }

    pub fn gated(chapters: Vec<Chapter>, gate: Arc<Semaphore>) -> Self {
        Self {
            listing_gate: Some(gate),
            ..Self::new(chapters)
        }
    }

    pub fn fetch_gated(chapters: Vec<Chapter>, gate: Arc<Semaphore>) -> Self {
        Self {
            fetch_gate: Some(gate),
            ..Self::new(chapters)
        }
    }

    pub async fn set_pages(&self, number: u32, assets: Vec<PageAsset>) {
        self.pages.lock().await.insert(number, assets);
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceClient for ScriptedSource {
    async fn list_available_chapters(&self) -> Result<Vec<Chapter>, SourceError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.listing_gate {
            let permit = gate
                .acquire()
                .await
                .map_err(|_| SourceError::Unavailable("gate closed".to_string()))?;
            permit.forget();
        }
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("scripted outage".to_string()));
        }
        Ok(self.chapters.lock().await.clone())
    }

    async fn fetch_page_assets(&self, chapter: u32) -> Result<Vec<PageAsset>, SourceError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_order.lock().await.push(chapter);
        let live = self.current_fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_fetches.fetch_max(live, Ordering::SeqCst);

        let result = async {
            if let Some(gate) = &self.fetch_gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| SourceError::Unavailable("gate closed".to_string()))?;
                permit.forget();
            }
            if self.fail_next_fetch.swap(false, Ordering::SeqCst) {
                return Err(SourceError::Unavailable("scripted outage".to_string()));
            }
            self.pages
                .lock()
                .await
                .get(&chapter)
                .cloned()
                .ok_or(SourceError::ChapterNotAvailable(chapter))
        }
        .await;

        self.current_fetches.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

#[derive(Default)]
pub struct RecordingEmail {
    pub sent: Mutex<Vec<(String, NotificationEvent)>>,
}

impl RecordingEmail {
    pub async fn count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl EmailChannel for RecordingEmail {
    async fn send(&self, address: &str, event: &NotificationEvent) -> anyhow::Result<()> {
        self.sent
            .lock()
            .await
            .push((address.to_string(), event.clone()));
        Ok(())
    }
}

pub struct NoopPush;

#[async_trait]
impl PushChannel for NoopPush {
    async fn send(
        &self,
        _subscription: &mangashelf::notify::registry::PushSubscription,
        _event: &NotificationEvent,
    ) -> Result<(), PushSendError> {
        Ok(())
    }
}

pub fn recording_notifier() -> (Arc<Notifier>, Arc<RecordingEmail>) {
    let registry = Arc::new(SubscriberRegistry::new());
    let email = Arc::new(RecordingEmail::default());
    let notifier = Arc::new(Notifier::new(
        registry,
        Arc::clone(&email) as Arc<dyn EmailChannel>,
        Arc::new(NoopPush),
        Duration::from_secs(5),
    ));
    (notifier, email)
}

pub struct TestHarness {
    pub source: Arc<ScriptedSource>,
    pub store: Arc<ArtifactStore>,
    pub pipeline: Arc<Pipeline>,
    pub notifier: Arc<Notifier>,
    pub email: Arc<RecordingEmail>,
}

pub async fn harness(source: ScriptedSource, root: &Path) -> TestHarness {
    let source = Arc::new(source);
    let store = Arc::new(ArtifactStore::open(root).await.expect("open store"));
    let (notifier, email) = recording_notifier();
    let pipeline = Arc::new(Pipeline::new(
        Arc::clone(&source) as Arc<dyn SourceClient>,
        Arc::clone(&store),
        Arc::clone(&notifier),
        "http://127.0.0.1:8001",
    ));
    TestHarness {
        source,
        store,
        pipeline,
        notifier,
        email,
    }
}

pub async fn wait_until(what: &str, deadline: Duration, mut check: impl AsyncFnMut() -> bool) {
    let start = Instant::now();
    while !check().await {
        assert!(
            start.elapsed() < deadline,
            "timed out waiting for: {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
