//! Error taxonomy for remote document ingestion

use thiserror::Error;

/// Everything that can go wrong while fetching or parsing a remote
/// playlist or guide document. None of these are fatal: callers recover
/// by skipping the source, keeping the previous snapshot, or reporting
/// the document as unavailable.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("request failed: {0}")]
    Http(#[from] Box<ureq::Error>),

    #[error("HTTP status {0}")]
    Status(u16),

    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("document too large: {size} bytes exceeds ceiling of {limit}")]
    Oversized { size: u64, limit: u64 },

    #[error("malformed document: {0}")]
    Malformed(String),

    #[error("wall-clock deadline exceeded")]
    Deadline,

    #[error("all {0} playlist sources failed")]
    AllSourcesFailed(usize),
}

impl From<ureq::Error> for CatalogError {
    fn from(e: ureq::Error) -> Self {
        CatalogError::Http(Box::new(e))
    }
}
