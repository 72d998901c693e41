use thiserror::Error;

/// Errors surfaced by the engine. Mirrors the reference `DownloadError`
/// enum, extended with the tree/assembly/probe failure kinds spec §7 names.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("disk error: {0}")]
    Disk(#[from] std::io::Error),

    #[error("segment too small to split further")]
    SegmentTooSmall,

    #[error("segment tree has no node matching {0:?}")]
    SegmentNotFound(crate::segment::Segment),

    #[error("tree invariant violated: {0}")]
    TreeInvariant(String),

    #[error("max connection retry count exceeded for connection {0}")]
    MaxRetryExceeded(u32),

    #[error("download cancelled")]
    Cancelled,

    #[error("assembly failed: final length {actual} != expected {expected}")]
    AssembleLengthMismatch { expected: u64, actual: u64 },

    #[error("source does not expose a content length")]
    UnsupportedSource,

    #[error("download {0} not found in the registry")]
    UnknownDownload(uuid::Uuid),
}
