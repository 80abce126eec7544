//! Error taxonomy for object-store and staging-file operations.

/// Classified failure of a store or staging operation.
///
/// Kinds, not transport types: the HTTP layer maps status codes and socket
/// errors into these before the core ever sees them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The object does not exist (HEAD/GET 404).
    #[error("object not found")]
    NotFound,

    /// The server rejected the credentials or policy (403).
    #[error("access denied")]
    AccessDenied,

    /// A conditional request failed (412), e.g. on multipart complete.
    #[error("precondition failed")]
    PreconditionFailed,

    /// The server asked us to slow down (429 / 503 SlowDown).
    #[error("throttled by server")]
    Throttled,

    /// 5xx, timeout or connection reset; worth retrying.
    #[error("transient server error: {0}")]
    ServerTransient(String),

    /// Malformed request, missing credentials, cancellation; not retryable.
    #[error("client error: {0}")]
    ClientFatal(String),

    /// Staging-file I/O failed.
    #[error("staging file I/O: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Post-upload verification failed (ETag mismatch).
    #[error("integrity check failed: {0}")]
    Integrity(String),
}

impl StoreError {
    /// Whether a retry with backoff may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Throttled | Self::ServerTransient(_))
    }

    /// The errno this error surfaces as at the FUSE boundary.
    pub fn errno(&self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::AccessDenied => libc::EACCES,
            Self::PreconditionFailed
            | Self::Throttled
            | Self::ServerTransient(_)
            | Self::ClientFatal(_)
            | Self::Integrity(_) => libc::EIO,
            Self::LocalIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
