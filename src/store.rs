use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use tokio::fs;
use tokio::sync::RwLock;

use crate::error::DownloadError;

/// Persisted record of one fully assembled chapter. Written only as part of
/// an atomic commit; there is never a record without its artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadedChapter {
    pub chapter_number: u32,
    pub title: String,
    pub page_count: u32,
    pub artifact_path: PathBuf,
    pub downloaded_at: DateTime<Utc>,
    pub size_bytes: u64,
    pub sha256: String,
}

const SIDECAR_NAME: &str = "chapter.json";

/// On-disk catalog of downloaded chapters. Layout under the artifact root:
/// one directory per chapter number holding `chapter-<n>.epub` plus a
/// `chapter.json` sidecar record. The in-memory index is rebuilt from the
/// directory tree at startup, so losing a sidecar is recoverable.
pub struct ArtifactStore {
    root: PathBuf,
    index: RwLock<BTreeMap<u32, DownloadedChapter>>,
}

impl ArtifactStore {
    pub async fn open(root: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create artifact root: {}", root.display()))?;
        let index = rescan(&root).await.context("rescan artifact root")?;
        if !index.is_empty() {
            tracing::info!(chapters = index.len(), root = %root.display(), "catalog loaded");
        }
        Ok(Self {
            root,
            index: RwLock::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn chapter_dir(&self, number: u32) -> PathBuf {
        self.root.join(number.to_string())
    }

    pub fn artifact_path(&self, number: u32) -> PathBuf {
        self.chapter_dir(number).join(format!("chapter-{number}.epub"))
    }

    fn sidecar_path(&self, number: u32) -> PathBuf {
        self.chapter_dir(number).join(SIDECAR_NAME)
    }

    pub async fn get(&self, number: u32) -> Option<DownloadedChapter> {
        self.index.read().await.get(&number).cloned()
    }

    pub async fn contains(&self, number: u32) -> bool {
        self.index.read().await.contains_key(&number)
    }

    /// Ascending by chapter number.
    pub async fn list(&self) -> Vec<DownloadedChapter> {
        self.index.read().await.values().cloned().collect()
    }

    /// Publishes a finished artifact: fsync the temp file, rename it to its
    /// final path, then write the sidecar record. If the sidecar write
    /// fails the artifact is rolled back so the invariant (record iff
    /// artifact) holds either way.
    pub async fn commit(
        &self,
        mut record: DownloadedChapter,
        tmp_artifact: &Path,
    ) -> Result<DownloadedChapter, DownloadError> {
        let number = record.chapter_number;
        let final_path = self.artifact_path(number);
        let dir = self.chapter_dir(number);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| DownloadError::Store(format!("create {}: {err}", dir.display())))?;

        let file = fs::File::open(tmp_artifact).await.map_err(|err| {
            DownloadError::Store(format!("open temp artifact {}: {err}", tmp_artifact.display()))
        })?;
        file.sync_all()
            .await
            .map_err(|err| DownloadError::Store(format!("fsync temp artifact: {err}")))?;
        drop(file);

        fs::rename(tmp_artifact, &final_path).await.map_err(|err| {
            DownloadError::Store(format!(
                "rename artifact into place {}: {err}",
                final_path.display()
            ))
        })?;
        record.artifact_path = final_path.clone();

        if let Err(err) = write_json_atomic(&self.sidecar_path(number), &record).await {
            // Roll back the published artifact rather than leave it
            // unrecorded until the next rescan.
            if let Err(rm_err) = fs::remove_file(&final_path).await {
                tracing::warn!(chapter = number, ?rm_err, "rollback of artifact failed");
            }
            return Err(DownloadError::Store(format!(
                "write catalog record for chapter {number}: {err:#}"
            )));
        }

        self.index.write().await.insert(number, record.clone());
        tracing::info!(
            chapter = number,
            pages = record.page_count,
            size_bytes = record.size_bytes,
            "chapter committed to catalog"
        );
        Ok(record)
    }

    /// Removes a chapter's artifact, sidecar and index entry. Returns false
    /// if the chapter was not in the catalog.
    pub async fn remove(&self, number: u32) -> anyhow::Result<bool> {
        let existed = self.index.write().await.remove(&number).is_some();
        let dir = self.chapter_dir(number);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(existed),
            Err(err) => Err(err).with_context(|| format!("remove {}", dir.display())),
        }
    }
}

async fn rescan(root: &Path) -> anyhow::Result<BTreeMap<u32, DownloadedChapter>> {
    let mut index = BTreeMap::new();
    let mut dir = match fs::read_dir(root).await {
        Ok(dir) => dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(index),
        Err(err) => return Err(err.into()),
    };

    while let Some(entry) = dir.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Ok(number) = name.to_string_lossy().parse::<u32>() else {
            continue;
        };

        let artifact_path = entry.path().join(format!("chapter-{number}.epub"));
        if !artifact_path.exists() {
            // Sidecar without artifact (interrupted rollback) is stale.
            continue;
        }

        let sidecar = entry.path().join(SIDECAR_NAME);
        match read_json::<DownloadedChapter>(&sidecar).await {
            Ok(Some(record)) if record.chapter_number == number => {
                index.insert(number, record);
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(chapter = number, ?err, "unreadable catalog record; rebuilding");
            }
        }

        // Artifact present but record missing or corrupt: re-derive the
        // record from the artifact itself and heal the sidecar.
        let record = {
            let artifact_path = artifact_path.clone();
            tokio::task::spawn_blocking(move || rebuild_record(number, &artifact_path))
                .await
                .context("join rebuild task")?
        };
        match record {
            Ok(record) => {
                write_json_atomic(&sidecar, &record)
                    .await
                    .context("rewrite rebuilt catalog record")?;
                tracing::info!(chapter = number, "catalog record rebuilt from artifact");
                index.insert(number, record);
            }
            Err(err) => {
                tracing::warn!(chapter = number, ?err, "artifact unreadable; skipping");
            }
        }
    }

    Ok(index)
}

fn rebuild_record(number: u32, artifact_path: &Path) -> anyhow::Result<DownloadedChapter> {
    let bytes = std::fs::read(artifact_path)
        .with_context(|| format!("read artifact: {}", artifact_path.display()))?;
    let size_bytes = bytes.len() as u64;
    let sha256 = hex::encode(sha2::Sha256::digest(&bytes));

    let reader = std::io::Cursor::new(bytes);
    let mut zip = zip::ZipArchive::new(reader).context("open artifact as zip")?;
    let mut page_count = 0u32;
    for i in 0..zip.len() {
        let entry = zip.by_index(i).context("read zip entry")?;
        if entry.name().starts_with(crate::epub::PAGE_DOC_PREFIX) {
            page_count += 1;
        }
    }
    if page_count == 0 {
        anyhow::bail!("artifact has no page documents: {}", artifact_path.display());
    }

    let downloaded_at = std::fs::metadata(artifact_path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    Ok(DownloadedChapter {
        chapter_number: number,
        title: format!("Kapitel {number}"),
        page_count,
        artifact_path: artifact_path.to_path_buf(),
        downloaded_at,
        size_bytes,
        sha256,
    })
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let value = serde_json::from_slice(&bytes).context("parse json")?;
    Ok(Some(value))
}

async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("path has no parent: {}", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("create parent dir: {}", parent.display()))?;

    let tmp_path = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    fs::write(&tmp_path, &data)
        .await
        .with_context(|| format!("write tmp: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path)
        .await
        .with_context(|| format!("rename tmp to final: {}", path.display()))?;
    Ok(())
}
