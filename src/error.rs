use thiserror::Error;

/// Errors from the remote source. `Unavailable` covers transport failures
/// and 5xx responses after retries are exhausted; `Parse` means the listing
/// or chapter page HTML did not contain the expected embedded JSON.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse source page: {0}")]
    Parse(String),

    #[error("chapter {0} is not available on the source")]
    ChapterNotAvailable(u32),
}

/// Errors surfaced by the download pipeline. All of these are local to one
/// chapter: a failed chapter stays absent from the catalog and is retried
/// on the next discovery pass.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("chapter {0} is not available")]
    ChapterNotAvailable(u32),

    #[error("incomplete page set for chapter {chapter}: declared {expected} pages, got {actual}")]
    IncompletePageSet {
        chapter: u32,
        expected: u32,
        actual: u32,
    },

    #[error("source unavailable: {0}")]
    SourceUnavailable(String),

    #[error("failed to parse source page: {0}")]
    Parse(String),

    #[error("artifact assembly failed: {0}")]
    AssemblyFailure(String),

    #[error("storage full while writing artifact")]
    StorageFull,

    #[error("catalog error: {0}")]
    Store(String),
}

impl From<SourceError> for DownloadError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Unavailable(msg) => DownloadError::SourceUnavailable(msg),
            SourceError::Parse(msg) => DownloadError::Parse(msg),
            SourceError::ChapterNotAvailable(number) => DownloadError::ChapterNotAvailable(number),
        }
    }
}

pub(crate) fn io_to_download(err: std::io::Error) -> DownloadError {
    if err.kind() == std::io::ErrorKind::StorageFull {
        DownloadError::StorageFull
    } else {
        DownloadError::AssemblyFailure(err.to_string())
    }
}
