use std::path::PathBuf;

use thiserror::Error;

/// Fatal stage signals. Each aborts its pipeline stage; `main` propagates them
/// so the external scheduler sees a nonzero exit with the reason.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("links file not found at {}", .0.display())]
    LinksMissing(PathBuf),

    #[error("links file is empty: {}", .0.display())]
    LinksEmpty(PathBuf),

    #[error("too many failures: {failed}/{total}")]
    TooManyFailures { failed: usize, total: usize },

    #[error("scraping failed completely")]
    TotalFailure,

    #[error("no raw documents found to clean")]
    NoRawInput,

    #[error("no valid documents after cleaning")]
    NoValidOutput,
}

/// Per-page fetch failures. These are counted by the scrape loop, never fatal
/// on their own.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("timed out waiting for company information (challenge page likely)")]
    Timeout,

    #[error("no data extracted")]
    Empty,

    #[error("browser: {0}")]
    Browser(String),
}
