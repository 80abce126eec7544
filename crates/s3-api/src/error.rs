//! Error types for the S3 client.

/// Transport-level failure reported by an [`HttpClient`](crate::HttpClient)
/// backend.
#[derive(Debug, thiserror::Error)]
pub enum HttpClientError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// Classified S3 API failure.
#[derive(Debug, thiserror::Error)]
pub enum S3ApiError {
    #[error("no such key")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("slow down")]
    Throttled,
    /// 5xx with whatever diagnostic the server sent.
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    /// Remaining 4xx.
    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },
    #[error("transport: {0}")]
    Transport(#[from] HttpClientError),
    #[error("malformed response: {0}")]
    Xml(String),
}

impl S3ApiError {
    /// Map a non-success status and error body to the right kind.
    pub(crate) fn from_status(status: http::StatusCode, body: &[u8]) -> Self {
        let message = crate::xml::text_of(&String::from_utf8_lossy(body), "Code")
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_owned());
        match status.as_u16() {
            404 => Self::NotFound,
            403 => Self::AccessDenied,
            412 => Self::PreconditionFailed,
            429 => Self::Throttled,
            503 if message == "SlowDown" => Self::Throttled,
            s if status.is_server_error() => Self::Server { status: s, message },
            s => Self::Client { status: s, message },
        }
    }
}
