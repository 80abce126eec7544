//! The object-store surface the core consumes.
//!
//! Transport, signing and response parsing live behind this trait; the
//! in-tree implementation adapts the `s3-api` client, and tests substitute
//! scripted mocks. Every method maps to exactly one HTTP request.

use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use rand::Rng as _;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::meta::Meta;
use crate::page_map::ByteRange;
use crate::pool::CancelFlag;

/// One object in a listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    /// Full object key as returned by the server.
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// A parsed page of `list-type=2` results.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<ListEntry>,
    /// Delimiter-rolled prefixes, each ending in `/`.
    pub common_prefixes: Vec<String>,
    /// Continuation token when the listing is truncated.
    pub next_token: Option<String>,
}

/// Ordered `(part_number, etag)` pairs for a multipart complete call.
pub type PartList = Vec<(u32, String)>;

/// Abstract object store with bucket, key and multipart-upload semantics.
pub trait ObjectStore: Send + Sync + 'static {
    /// HEAD: object metadata, or [`StoreError::NotFound`].
    fn head(&self, key: &str) -> impl Future<Output = StoreResult<Meta>> + Send;

    /// Range GET returning exactly the requested bytes (clamped by the
    /// server at end of object).
    fn get_range(
        &self,
        key: &str,
        range: ByteRange,
    ) -> impl Future<Output = StoreResult<Bytes>> + Send;

    /// Simple PUT of a complete object body with curated headers.
    fn put(
        &self,
        key: &str,
        body: Bytes,
        meta: &Meta,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Server-side copy with `x-amz-metadata-directive: REPLACE`; used for
    /// rename and for metadata-only updates (`src == dst`).
    fn put_copy(
        &self,
        src: &str,
        dst: &str,
        meta: &Meta,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// One page of `list-type=2` results under `prefix`. With
    /// `delimited = true` the listing rolls up at `/`.
    fn list(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
    ) -> impl Future<Output = StoreResult<ListPage>> + Send;

    /// `POST ?uploads`: returns the upload id.
    fn initiate_multipart(
        &self,
        key: &str,
        meta: &Meta,
    ) -> impl Future<Output = StoreResult<String>> + Send;

    /// `PUT ?partNumber=N&uploadId=U` with a body: returns the part ETag.
    fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> impl Future<Output = StoreResult<String>> + Send;

    /// `PUT ?partNumber=N&uploadId=U` with `x-amz-copy-source[-range]`:
    /// returns the part ETag.
    fn copy_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src: &str,
        range: ByteRange,
    ) -> impl Future<Output = StoreResult<String>> + Send;

    /// `POST ?uploadId=U` with the ordered part list.
    fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &PartList,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// `DELETE ?uploadId=U`. Best-effort on the abort path.
    fn abort_multipart(
        &self,
        key: &str,
        upload_id: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}

/// Exponential backoff with jitter for retryable store errors.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `n + 1` (`n` is zero-based): doubles per
    /// attempt, capped at `max_delay`, plus up to 50% random jitter.
    fn delay(&self, n: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << n.min(16))
            .min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0..=exp.as_millis() as u64 / 2);
        exp + Duration::from_millis(jitter)
    }
}

/// Drive `op` under `policy`, retrying [retryable](StoreError::is_retryable)
/// failures and checking `cancel` between attempts.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancelFlag,
    what: &str,
    mut op: F,
) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(StoreError::ClientFatal(format!("{what}: cancelled")));
        }
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt + 1 < policy.attempts => {
                let delay = policy.delay(attempt);
                debug!(%what, attempt, error = %e, ?delay, "retrying after transient error");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(%what, attempt, error = %e, "retry budget exhausted");
                }
                return Err(e);
            }
        }
    }
}
