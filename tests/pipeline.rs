use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::Semaphore;

use mangashelf::error::DownloadError;

mod support;
use support::{ScriptedSource, chapter, harness, page_assets, wait_until};

#[tokio::test]
async fn download_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 3, true)]),
        dir.path(),
    )
    .await;

    let first = h.pipeline.download_chapter(1156).await.unwrap();
    let second = h.pipeline.download_chapter(1156).await.unwrap();

    assert_eq!(first.sha256, second.sha256);
    assert_eq!(h.source.fetch_calls(), 1);
    assert!(first.artifact_path.exists());
}

#[tokio::test]
async fn concurrent_requests_share_one_download() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 3, true)]),
        dir.path(),
    )
    .await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let pipeline = Arc::clone(&h.pipeline);
        handles.push(tokio::spawn(
            async move { pipeline.download_chapter(1156).await },
        ));
    }

    let mut shas = Vec::new();
    for handle in handles {
        shas.push(handle.await.unwrap().unwrap().sha256);
    }
    shas.dedup();
    assert_eq!(shas.len(), 1);
    assert_eq!(h.source.fetch_calls(), 1);
}

#[tokio::test]
async fn failed_leader_hands_off_without_concurrent_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let gate = Arc::new(Semaphore::new(0));
    let h = harness(
        ScriptedSource::fetch_gated(vec![chapter(1156, 3, true)], Arc::clone(&gate)),
        dir.path(),
    )
    .await;
    h.notifier
        .registry()
        .subscribe_email("fan@example.com")
        .await;
    h.source.fail_next_fetch.store(true, Ordering::SeqCst);

    // The first caller enters the page fetch and parks on the gate.
    let leader = {
        let pipeline = Arc::clone(&h.pipeline);
        tokio::spawn(async move { pipeline.download_chapter(1156).await })
    };
    wait_until("leader reaches the page fetch", Duration::from_secs(5), async || {
        h.source.fetch_calls() == 1
    })
    .await;

    // A second caller queues up behind the in-flight download.
    let waiter = {
        let pipeline = Arc::clone(&h.pipeline);
        tokio::spawn(async move { pipeline.download_chapter(1156).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    gate.add_permits(1);
    assert!(leader.await.unwrap().is_err());

    // The queued caller takes over as the new leader and retries; a third
    // caller arrives while that retry is still in flight.
    wait_until("successor retries the fetch", Duration::from_secs(5), async || {
        h.source.fetch_calls() == 2
    })
    .await;
    let late = {
        let pipeline = Arc::clone(&h.pipeline);
        tokio::spawn(async move { pipeline.download_chapter(1156).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    gate.add_permits(16);

    let first = waiter.await.unwrap().unwrap();
    let second = late.await.unwrap().unwrap();
    assert_eq!(first.sha256, second.sha256);

    // At no point were two page fetches running for the same chapter, and
    // the one successful commit notified exactly once.
    assert_eq!(h.source.max_concurrent_fetches.load(Ordering::SeqCst), 1);
    assert_eq!(h.source.fetch_calls(), 2);
    wait_until("notification delivery", Duration::from_secs(5), async || {
        h.email.count().await == 1
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.email.count().await, 1);
}

#[tokio::test]
async fn unlisted_chapter_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 3, true), chapter(1157, 0, false)]),
        dir.path(),
    )
    .await;

    let err = h.pipeline.download_chapter(1157).await.unwrap_err();
    assert!(matches!(err, DownloadError::ChapterNotAvailable(1157)));
    let err = h.pipeline.download_chapter(9999).await.unwrap_err();
    assert!(matches!(err, DownloadError::ChapterNotAvailable(9999)));
    assert!(!h.store.contains(1157).await);
}

#[tokio::test]
async fn incomplete_page_set_leaves_no_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 5, true)]),
        dir.path(),
    )
    .await;
    h.source.set_pages(1156, page_assets(1156, 3)).await;

    let err = h.pipeline.download_chapter(1156).await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::IncompletePageSet {
            chapter: 1156,
            expected: 5,
            actual: 3,
        }
    ));
    assert!(!h.store.contains(1156).await);
    assert!(!dir.path().join("1156").exists());
}

#[tokio::test]
async fn failed_assembly_leaves_no_record_and_is_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 3, true)]),
        dir.path(),
    )
    .await;

    // A plain file where the chapter directory belongs makes the write
    // side fail while listing and page fetches still succeed.
    let chapter_dir = dir.path().join("1156");
    std::fs::write(&chapter_dir, b"in the way").unwrap();

    let err = h.pipeline.download_chapter(1156).await.unwrap_err();
    assert!(matches!(
        err,
        DownloadError::AssemblyFailure(_) | DownloadError::Store(_)
    ));
    assert!(!h.store.contains(1156).await);

    std::fs::remove_file(&chapter_dir).unwrap();
    let record = h.pipeline.download_chapter(1156).await.unwrap();
    assert!(record.artifact_path.exists());
}

#[tokio::test]
async fn successful_download_notifies_subscribers_once() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(
        ScriptedSource::new(vec![chapter(1156, 3, true)]),
        dir.path(),
    )
    .await;
    h.notifier
        .registry()
        .subscribe_email("fan@example.com")
        .await;

    h.pipeline.download_chapter(1156).await.unwrap();
    wait_until("notification delivery", Duration::from_secs(5), async || {
        h.email.count().await == 1
    })
    .await;

    // A repeat download of the same chapter must not re-notify.
    h.pipeline.download_chapter(1156).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = h.email.sent.lock().await;
    assert_eq!(sent.len(), 1);
    let (address, event) = &sent[0];
    assert_eq!(address, "fan@example.com");
    assert_eq!(event.chapter_number, 1156);
    assert!(event.url.ends_with("/api/chapters/1156/epub"));
}
