//! Adapts the S3 client to the core's [`ObjectStore`] trait.
//!
//! Two header models meet here: the transport's `http::HeaderMap`
//! (lowercased names) and the core's case-preserving [`Meta`]. Response
//! headers cross into `Meta` unfiltered; request headers are the curated
//! subset minus the transport-owned ones (`content-length`, `etag`,
//! `last-modified`).

use bytes::Bytes;
use http::HeaderMap;

use objfs::ByteRange;
use objfs::error::{StoreError, StoreResult};
use objfs::meta::Meta;
use objfs::store::{ListEntry, ListPage, ObjectStore, PartList};
use s3_api::sign::Signer;
use s3_api::{HttpClient, S3ApiError, S3Client};

pub struct S3Store<C: HttpClient, G: Signer> {
    client: S3Client<C, G>,
}

impl<C: HttpClient, G: Signer> S3Store<C, G> {
    pub fn new(client: S3Client<C, G>) -> Self {
        Self { client }
    }
}

fn meta_from_headers(headers: &HeaderMap) -> Meta {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect()
}

/// Headers the transport computes itself, or that only make sense on a
/// response.
fn is_response_only(name: &str) -> bool {
    name.eq_ignore_ascii_case("content-length")
        || name.eq_ignore_ascii_case("etag")
        || name.eq_ignore_ascii_case("last-modified")
}

fn headers_from_meta(meta: &Meta) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in meta.curated().iter() {
        if is_response_only(name) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            http::header::HeaderName::try_from(name),
            http::HeaderValue::from_str(value),
        ) {
            headers.insert(n, v);
        }
    }
    headers
}

fn map_err(err: S3ApiError) -> StoreError {
    match err {
        S3ApiError::NotFound => StoreError::NotFound,
        S3ApiError::AccessDenied => StoreError::AccessDenied,
        S3ApiError::PreconditionFailed => StoreError::PreconditionFailed,
        S3ApiError::Throttled => StoreError::Throttled,
        S3ApiError::Server { status, message } => {
            StoreError::ServerTransient(format!("{status}: {message}"))
        }
        S3ApiError::Client { status, message } => {
            StoreError::ClientFatal(format!("{status}: {message}"))
        }
        S3ApiError::Transport(t) => StoreError::ServerTransient(t.to_string()),
        S3ApiError::Xml(m) => StoreError::ClientFatal(m),
    }
}

impl<C: HttpClient, G: Signer> ObjectStore for S3Store<C, G> {
    async fn head(&self, key: &str) -> StoreResult<Meta> {
        let headers = self.client.head_object(key).await.map_err(map_err)?;
        Ok(meta_from_headers(&headers))
    }

    async fn get_range(&self, key: &str, range: ByteRange) -> StoreResult<Bytes> {
        if range.len == 0 {
            return Ok(Bytes::new());
        }
        self.client
            .get_object_range(key, range.offset, range.len)
            .await
            .map_err(map_err)
    }

    async fn put(&self, key: &str, body: Bytes, meta: &Meta) -> StoreResult<()> {
        self.client
            .put_object(key, body, headers_from_meta(meta))
            .await
            .map_err(map_err)
    }

    async fn put_copy(&self, src: &str, dst: &str, meta: &Meta) -> StoreResult<()> {
        self.client
            .copy_object(src, dst, headers_from_meta(meta))
            .await
            .map_err(map_err)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        match self.client.delete_object(key).await {
            Ok(()) | Err(S3ApiError::NotFound) => Ok(()),
            Err(e) => Err(map_err(e)),
        }
    }

    async fn list(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
    ) -> StoreResult<ListPage> {
        let page = self
            .client
            .list_objects_v2(prefix, delimited, token)
            .await
            .map_err(map_err)?;
        Ok(ListPage {
            entries: page
                .objects
                .into_iter()
                .map(|o| ListEntry {
                    key: o.key,
                    size: o.size,
                    etag: o.etag,
                })
                .collect(),
            common_prefixes: page.common_prefixes,
            next_token: page.next_token,
        })
    }

    async fn initiate_multipart(&self, key: &str, meta: &Meta) -> StoreResult<String> {
        self.client
            .create_multipart_upload(key, headers_from_meta(meta))
            .await
            .map_err(map_err)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> StoreResult<String> {
        self.client
            .upload_part(key, upload_id, part_number, body)
            .await
            .map_err(map_err)
    }

    async fn copy_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src: &str,
        range: ByteRange,
    ) -> StoreResult<String> {
        self.client
            .upload_part_copy(key, upload_id, part_number, src, range.offset, range.len)
            .await
            .map_err(map_err)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &PartList,
    ) -> StoreResult<()> {
        self.client
            .complete_multipart_upload(key, upload_id, parts)
            .await
            .map_err(map_err)
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) -> StoreResult<()> {
        self.client
            .abort_multipart_upload(key, upload_id)
            .await
            .map_err(map_err)
    }
}
