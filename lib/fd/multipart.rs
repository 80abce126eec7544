//! Multipart upload scheduling.
//!
//! Converts the dirty-page map of a staged file into a parallel sequence of
//! initiate / upload-part / complete requests, using server-side part
//! copies for regions the local writer never touched. Part numbers are
//! assigned before dispatch; completion order never affects the final
//! object.

use std::sync::{Arc, Mutex};

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::meta::Meta;
use crate::page_map::ByteRange;
use crate::pool::{CancelFlag, RequestPool};
use crate::store::{ObjectStore, PartList, RetryPolicy, with_retries};

use super::entity::FileEntity;

/// Smallest part the protocol accepts for every part but the last.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// Largest single part the protocol accepts.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Where a part's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartSource {
    /// Uploaded from the staging file.
    Staging(ByteRange),
    /// Server-side copy of the prior object version.
    Copy(ByteRange),
}

impl PartSource {
    pub fn range(&self) -> ByteRange {
        match self {
            Self::Staging(r) | Self::Copy(r) => *r,
        }
    }

    fn is_staging(&self) -> bool {
        matches!(self, Self::Staging(_))
    }
}

/// One planned part with its 1-based protocol part number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub number: u32,
    pub source: PartSource,
}

/// Progress of one multipart upload, for logging and assertions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadPhase {
    Initiated,
    Dispatching,
    Completing,
    Aborting,
}

/// Partition `[0, size)` into parts of `part_size` bytes.
///
/// A slot overlapping any modified range becomes an upload part sourced
/// from staging; untouched slots become copy parts. A trailing slot
/// smaller than [`MIN_PART_SIZE`] is absorbed into its predecessor when
/// both have the same source kind (a short *last* part is legal either
/// way, so mixed-kind tails are left alone).
pub fn partition(size: u64, modified: &[ByteRange], part_size: u64) -> Vec<PartPlan> {
    assert!(part_size >= MIN_PART_SIZE, "part size below protocol floor");
    assert!(part_size <= MAX_PART_SIZE, "part size above protocol cap");

    let mut sources = Vec::new();
    let mut cursor = 0u64;
    let mut next_dirty = modified.iter().copied().peekable();
    while cursor < size {
        let slot = ByteRange::new(cursor, part_size.min(size - cursor));
        while next_dirty
            .peek()
            .is_some_and(|r| r.end() <= slot.offset)
        {
            next_dirty.next();
        }
        let dirty = next_dirty
            .peek()
            .and_then(|r| r.intersect(&slot))
            .is_some();
        sources.push(if dirty {
            PartSource::Staging(slot)
        } else {
            PartSource::Copy(slot)
        });
        cursor = slot.end();
    }

    if let [.., prev, last] = sources[..]
        && last.range().len < MIN_PART_SIZE
        && prev.is_staging() == last.is_staging()
    {
        let merged = ByteRange::new(prev.range().offset, prev.range().len + last.range().len);
        sources.pop();
        *sources
            .last_mut()
            .unwrap_or_else(|| unreachable!("prev exists")) = if prev.is_staging() {
            PartSource::Staging(merged)
        } else {
            PartSource::Copy(merged)
        };
    }

    sources
        .into_iter()
        .enumerate()
        .map(|(i, source)| PartPlan {
            number: u32::try_from(i + 1).unwrap_or_else(|_| unreachable!("part count bounded")),
            source,
        })
        .collect()
}

/// Run a planned multipart upload to completion.
///
/// All parts are dispatched concurrently, bounded by the pool width. Each
/// part retries independently under `retry`; the first part to exhaust its
/// budget raises the shared cancel flag, peers stop between attempts, and
/// the upload is aborted (best-effort) before the error is returned.
pub(crate) async fn upload<S: ObjectStore>(
    store: &Arc<S>,
    pool: &RequestPool,
    retry: &RetryPolicy,
    entity: &Arc<FileEntity>,
    meta: &Meta,
    plans: Vec<PartPlan>,
) -> StoreResult<()> {
    let key = entity.key().to_owned();
    let cancel = CancelFlag::new();

    let upload_id = with_retries(retry, &cancel, "initiate multipart", || {
        store.initiate_multipart(&key, meta)
    })
    .await?;
    debug!(%key, %upload_id, parts = plans.len(), phase = ?UploadPhase::Initiated, "multipart upload started");

    // One ETag slot per part, filled by workers in any order.
    let etags: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(vec![None; plans.len()]));

    debug!(%key, phase = ?UploadPhase::Dispatching, "dispatching parts");
    let mut set: JoinSet<Option<StoreError>> = JoinSet::new();
    for (slot, plan) in plans.iter().copied().enumerate() {
        let store = Arc::clone(store);
        let entity = Arc::clone(entity);
        let etags = Arc::clone(&etags);
        let cancel = cancel.clone();
        let retry = *retry;
        let key = key.clone();
        let upload_id = upload_id.clone();

        pool.spawn_on(&mut set, async move {
            let result = match plan.source {
                PartSource::Staging(range) => {
                    let body = match entity.read_staging(range) {
                        Ok(b) => b,
                        Err(e) => {
                            cancel.cancel();
                            return Some(e);
                        }
                    };
                    with_retries(&retry, &cancel, "upload part", || {
                        store.upload_part(&key, &upload_id, plan.number, body.clone())
                    })
                    .await
                }
                PartSource::Copy(range) => {
                    with_retries(&retry, &cancel, "copy part", || {
                        store.copy_part(&key, &upload_id, plan.number, &key, range)
                    })
                    .await
                }
            };
            match result {
                Ok(etag) => {
                    etags
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)[slot] = Some(etag);
                    None
                }
                Err(e) => {
                    warn!(key = %key, part = plan.number, error = %e, "part failed");
                    cancel.cancel();
                    Some(e)
                }
            }
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Some(e)) => first_error.get_or_insert(e),
            Ok(None) => continue,
            Err(join_err) => first_error
                .get_or_insert(StoreError::ClientFatal(format!("part task died: {join_err}"))),
        };
    }

    if let Some(e) = first_error {
        debug!(%key, %upload_id, phase = ?UploadPhase::Aborting, "aborting multipart upload");
        abort_best_effort(store, retry, &key, &upload_id).await;
        return Err(e);
    }

    let parts: PartList = {
        let slots = etags
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        plans
            .iter()
            .zip(slots.iter())
            .map(|(plan, etag)| {
                let etag = etag
                    .clone()
                    .unwrap_or_else(|| unreachable!("all parts reported success"));
                (plan.number, etag)
            })
            .collect()
    };

    debug!(%key, %upload_id, phase = ?UploadPhase::Completing, "completing multipart upload");
    if let Err(e) = with_retries(retry, &cancel, "complete multipart", || {
        store.complete_multipart(&key, &upload_id, &parts)
    })
    .await
    {
        debug!(%key, %upload_id, phase = ?UploadPhase::Aborting, "aborting after failed complete");
        abort_best_effort(store, retry, &key, &upload_id).await;
        return Err(e);
    }

    Ok(())
}

/// Abort never out-ranks the error that caused it; failures are only logged.
async fn abort_best_effort<S: ObjectStore>(
    store: &Arc<S>,
    retry: &RetryPolicy,
    key: &str,
    upload_id: &str,
) {
    let cancel = CancelFlag::new();
    if let Err(e) = with_retries(retry, &cancel, "abort multipart", || {
        store.abort_multipart(key, upload_id)
    })
    .await
    {
        warn!(%key, %upload_id, error = %e, "abort failed; upload left to bucket lifecycle");
    }
}
