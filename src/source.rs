use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::SourceError;

/// One chapter as advertised by the remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub number: u32,
    pub title: String,
    pub published_date: Option<String>,
    pub page_count: u32,
    pub available: bool,
}

/// A single downloaded page image. Exists only while a pipeline run is in
/// flight; pages are never persisted outside the assembled artifact.
#[derive(Debug, Clone)]
pub struct PageAsset {
    pub chapter_number: u32,
    pub page_index: u32,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait SourceClient: Send + Sync {
    /// All chapters the source currently advertises, ascending by number.
    async fn list_available_chapters(&self) -> Result<Vec<Chapter>, SourceError>;

    /// All page images for one chapter, ordered by page index.
    async fn fetch_page_assets(&self, chapter: u32) -> Result<Vec<PageAsset>, SourceError>;

    async fn fetch_latest_chapter_number(&self) -> Result<u32, SourceError> {
        let chapters = self.list_available_chapters().await?;
        chapters
            .iter()
            .map(|c| c.number)
            .max()
            .ok_or_else(|| SourceError::Parse("listing contained no chapters".to_string()))
    }
}

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(4);

// The source refuses requests with generic client user agents.
const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) Chrome/115.0 Safari/537.36";

// Literal marker the site renders when a chapter page exists but its images
// are not currently served.
const UNAVAILABLE_MARKER: &str = "Dieses Kapitel ist aktuell nicht verf";

/// HTTP implementation against the real source. The chapter table and the
/// per-chapter page URLs are not exposed as an API; both are embedded as
/// JSON inside the site's HTML and extracted here.
pub struct HttpSourceClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSourceClient {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let parsed = url::Url::parse(&base_url)
            .map_err(|err| anyhow::anyhow!("invalid source base url {base_url}: {err}"))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            anyhow::bail!("source base url must be http/https: {base_url}");
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client, base_url })
    }

    fn listing_url(&self) -> String {
        format!("{}/manga/kapitel-mangaliste", self.base_url)
    }

    fn chapter_url(&self, chapter: u32) -> String {
        format!("{}/manga/kapitel/{chapter}/1", self.base_url)
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, SourceError> {
        let mut delay = RETRY_BASE_DELAY;
        let mut last_err = String::new();

        for attempt in 1..=RETRY_ATTEMPTS {
            match self.client.get(url).send().await {
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = format!("GET {url} returned {}", resp.status());
                }
                Ok(resp) => return Ok(resp),
                Err(err) => {
                    last_err = format!("GET {url}: {err}");
                }
            }
            if attempt < RETRY_ATTEMPTS {
                tracing::debug!(url, attempt, "source request failed; backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
        }

        Err(SourceError::Unavailable(last_err))
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn list_available_chapters(&self) -> Result<Vec<Chapter>, SourceError> {
        let url = self.listing_url();
        let resp = self.get_with_retry(&url).await?;
        if !resp.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        let html = resp
            .text()
            .await
            .map_err(|err| SourceError::Unavailable(format!("read listing body: {err}")))?;

        parse_listing(&html)
    }

    async fn fetch_page_assets(&self, chapter: u32) -> Result<Vec<PageAsset>, SourceError> {
        let url = self.chapter_url(chapter);
        let resp = self.get_with_retry(&url).await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::ChapterNotAvailable(chapter));
        }
        if !resp.status().is_success() {
            return Err(SourceError::Unavailable(format!(
                "GET {url} returned {}",
                resp.status()
            )));
        }
        let html = resp
            .text()
            .await
            .map_err(|err| SourceError::Unavailable(format!("read chapter page body: {err}")))?;
        if html.contains(UNAVAILABLE_MARKER) {
            return Err(SourceError::ChapterNotAvailable(chapter));
        }

        let page_urls = parse_chapter_page_urls(chapter, &html)?;

        let mut assets = Vec::with_capacity(page_urls.len());
        for (page_index, page_url) in page_urls.into_iter().enumerate() {
            let resp = self.get_with_retry(&page_url).await?;
            if !resp.status().is_success() {
                return Err(SourceError::Unavailable(format!(
                    "GET {page_url} returned {}",
                    resp.status()
                )));
            }
            let media_type = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
                .filter(|v| v.starts_with("image/"))
                .unwrap_or_else(|| media_type_from_url(&page_url));
            let bytes = resp
                .bytes()
                .await
                .map_err(|err| SourceError::Unavailable(format!("read page image: {err}")))?;

            assets.push(PageAsset {
                chapter_number: chapter,
                page_index: page_index as u32,
                media_type,
                bytes: bytes.to_vec(),
            });
        }

        Ok(assets)
    }
}

#[derive(Debug, Deserialize)]
struct ListingEntry {
    number: u32,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    date: Option<String>,
    #[serde(default)]
    pages: Option<u32>,
    #[serde(default)]
    is_available: Option<bool>,
}

fn parse_listing(html: &str) -> Result<Vec<Chapter>, SourceError> {
    let raw = extract_balanced(html, "\"entries\":", '[', ']')
        .ok_or_else(|| SourceError::Parse("entries array not found in listing page".to_string()))?;
    let entries: Vec<ListingEntry> = serde_json::from_str(raw)
        .map_err(|err| SourceError::Parse(format!("entries array: {err}")))?;

    let mut chapters: Vec<Chapter> = entries
        .into_iter()
        .filter(|e| e.number > 0)
        .map(|e| Chapter {
            title: e
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| format!("Kapitel {}", e.number)),
            published_date: e.date,
            page_count: e.pages.unwrap_or(0),
            available: e.is_available.unwrap_or(true),
            number: e.number,
        })
        .collect();
    chapters.sort_by_key(|c| c.number);
    chapters.dedup_by_key(|c| c.number);
    Ok(chapters)
}

#[derive(Debug, Deserialize)]
struct ChapterData {
    chapter: ChapterPayload,
}

#[derive(Debug, Deserialize)]
struct ChapterPayload {
    #[serde(default)]
    pages: Vec<PageRef>,
}

#[derive(Debug, Deserialize)]
struct PageRef {
    #[serde(default)]
    url: Option<String>,
}

fn parse_chapter_page_urls(chapter: u32, html: &str) -> Result<Vec<String>, SourceError> {
    let raw = extract_balanced(html, "window.__data", '{', '}').ok_or_else(|| {
        SourceError::Parse(format!("window.__data not found for chapter {chapter}"))
    })?;
    let data: ChapterData = serde_json::from_str(raw)
        .map_err(|err| SourceError::Parse(format!("chapter {chapter} data: {err}")))?;

    let mut urls = Vec::with_capacity(data.chapter.pages.len());
    for page in data.chapter.pages {
        match page.url {
            Some(url) if !url.trim().is_empty() => urls.push(url),
            _ => tracing::warn!(chapter, "skipping page without url"),
        }
    }
    Ok(urls)
}

/// Extracts the first balanced `open`..`close` region after `marker`,
/// string-aware so delimiters inside JSON strings do not confuse the depth
/// count. Returns the region including its delimiters.
fn extract_balanced<'a>(html: &'a str, marker: &str, open: char, close: char) -> Option<&'a str> {
    let marker_at = html.find(marker)?;
    let after = &html[marker_at + marker.len()..];
    let start = after.find(open)?;
    let region = &after[start..];

    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, ch) in region.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth -= 1;
            if depth == 0 {
                return Some(&region[..i + ch.len_utf8()]);
            }
        }
    }
    None
}

fn media_type_from_url(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit('.').next().unwrap_or_default().to_ascii_lowercase();
    match ext.as_str() {
        "png" => "image/png",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/jpeg",
    }
    .to_string()
}

/// Brief read-through cache in front of a listing call, for the REST
/// surface. Failures are never cached; a stale-but-valid listing is served
/// only within the TTL window.
pub struct CachedListing {
    ttl: Duration,
    slot: tokio::sync::Mutex<Option<(Instant, Vec<Chapter>)>>,
}

impl CachedListing {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            slot: tokio::sync::Mutex::new(None),
        }
    }

    pub async fn get(&self, source: &dyn SourceClient) -> Result<Vec<Chapter>, SourceError> {
        let mut slot = self.slot.lock().await;
        if let Some((fetched_at, chapters)) = slot.as_ref()
            && fetched_at.elapsed() < self.ttl
        {
            return Ok(chapters.clone());
        }
        let chapters = source.list_available_chapters().await?;
        *slot = Some((Instant::now(), chapters.clone()));
        Ok(chapters)
    }
}
