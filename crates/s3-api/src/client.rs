//! The S3 client: request construction for the object and multipart
//! operations bucketfs uses.

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method};
use tracing::trace;

use crate::error::S3ApiError;
use crate::http_client::{HttpClient, S3Request, S3Response};
use crate::sign::{Signer, uri_encode};
use crate::xml;

/// Where and how the bucket is addressed.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Scheme + authority, e.g. `https://s3.eu-central-1.amazonaws.com`.
    pub endpoint: String,
    pub bucket: String,
    pub region: String,
}

/// One listed object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedObject {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
}

/// One page of a `list-type=2` listing.
#[derive(Debug, Clone, Default)]
pub struct ListingPage {
    pub objects: Vec<ListedObject>,
    pub common_prefixes: Vec<String>,
    pub next_token: Option<String>,
}

/// S3 REST client over a pluggable transport and signer.
pub struct S3Client<C: HttpClient, G: Signer> {
    http: C,
    signer: G,
    config: S3Config,
}

type ApiResult<T> = Result<T, S3ApiError>;

impl<C: HttpClient, G: Signer> S3Client<C, G> {
    pub fn new(http: C, signer: G, config: S3Config) -> Self {
        Self {
            http,
            signer,
            config,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket
    }

    fn key_path(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode(&self.config.bucket, false),
            uri_encode(key, false)
        )
    }

    /// `x-amz-copy-source` value for a key in this bucket.
    fn copy_source(&self, key: &str) -> String {
        format!(
            "/{}/{}",
            uri_encode(&self.config.bucket, false),
            uri_encode(key, false)
        )
    }

    fn request(
        &self,
        method: Method,
        path: String,
        query: Vec<(String, String)>,
        headers: HeaderMap,
        body: Option<Bytes>,
    ) -> S3Request {
        let mut req = S3Request {
            method,
            endpoint: self.config.endpoint.clone(),
            path,
            query,
            headers,
            body,
        };
        self.signer.sign_request(&mut req, Utc::now());
        req
    }

    async fn send(&self, req: S3Request) -> ApiResult<S3Response> {
        trace!(method = %req.method, url = %req.url(), "s3 request");
        let response = self.http.send(req).await?;
        if response.status.is_success() {
            Ok(response)
        } else {
            Err(S3ApiError::from_status(response.status, &response.body))
        }
    }

    /// `HEAD /key`.
    pub async fn head_object(&self, key: &str) -> ApiResult<HeaderMap> {
        let req = self.request(
            Method::HEAD,
            self.key_path(key),
            Vec::new(),
            HeaderMap::new(),
            None,
        );
        Ok(self.send(req).await?.headers)
    }

    /// `GET /key` with `Range: bytes=start-end` (inclusive end).
    pub async fn get_object_range(&self, key: &str, start: u64, len: u64) -> ApiResult<Bytes> {
        let mut headers = HeaderMap::new();
        if len > 0 {
            let range = format!("bytes={start}-{}", start + len - 1);
            headers.insert(
                "range",
                range.parse().unwrap_or_else(|_| {
                    unreachable!("range header values are always valid ASCII")
                }),
            );
        }
        let req = self.request(Method::GET, self.key_path(key), Vec::new(), headers, None);
        Ok(self.send(req).await?.body)
    }

    /// `PUT /key` with the body and curated headers.
    pub async fn put_object(&self, key: &str, body: Bytes, headers: HeaderMap) -> ApiResult<()> {
        let req = self.request(
            Method::PUT,
            self.key_path(key),
            Vec::new(),
            headers,
            Some(body),
        );
        self.send(req).await?;
        Ok(())
    }

    /// `PUT /dst` with `x-amz-copy-source: /bucket/src` and the REPLACE
    /// metadata directive; used for rename and metadata-only updates.
    pub async fn copy_object(&self, src: &str, dst: &str, headers: HeaderMap) -> ApiResult<()> {
        let mut headers = headers;
        insert(&mut headers, "x-amz-copy-source", &self.copy_source(src));
        insert(&mut headers, "x-amz-metadata-directive", "REPLACE");
        let req = self.request(Method::PUT, self.key_path(dst), Vec::new(), headers, None);
        let response = self.send(req).await?;
        // A 200 can still carry an error document mid-copy.
        let text = String::from_utf8_lossy(&response.body);
        if text.contains("<Error>") {
            let message = xml::text_of(&text, "Code").unwrap_or_else(|| "copy failed".into());
            return Err(S3ApiError::Server {
                status: 200,
                message,
            });
        }
        Ok(())
    }

    /// `DELETE /key`.
    pub async fn delete_object(&self, key: &str) -> ApiResult<()> {
        let req = self.request(
            Method::DELETE,
            self.key_path(key),
            Vec::new(),
            HeaderMap::new(),
            None,
        );
        self.send(req).await?;
        Ok(())
    }

    /// One page of `GET /?list-type=2&prefix=…[&delimiter=/]`.
    pub async fn list_objects_v2(
        &self,
        prefix: &str,
        delimited: bool,
        token: Option<&str>,
    ) -> ApiResult<ListingPage> {
        let mut query = vec![
            ("list-type".to_owned(), "2".to_owned()),
            ("prefix".to_owned(), uri_encode(prefix, true)),
        ];
        if delimited {
            query.push(("delimiter".to_owned(), uri_encode("/", true)));
        }
        if let Some(token) = token {
            query.push(("continuation-token".to_owned(), uri_encode(token, true)));
        }

        let path = format!("/{}", uri_encode(&self.config.bucket, false));
        let req = self.request(Method::GET, path, query, HeaderMap::new(), None);
        let response = self.send(req).await?;
        let body = String::from_utf8_lossy(&response.body).into_owned();

        let mut page = ListingPage::default();
        for block in xml::blocks_of(&body, "Contents") {
            let Some(key) = xml::text_of(block, "Key") else {
                return Err(S3ApiError::Xml("Contents without Key".into()));
            };
            page.objects.push(ListedObject {
                key,
                size: xml::text_of(block, "Size")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0),
                etag: xml::text_of(block, "ETag"),
            });
        }
        for block in xml::blocks_of(&body, "CommonPrefixes") {
            if let Some(prefix) = xml::text_of(block, "Prefix") {
                page.common_prefixes.push(prefix);
            }
        }
        let truncated = xml::text_of(&body, "IsTruncated").as_deref() == Some("true");
        if truncated {
            page.next_token = xml::text_of(&body, "NextContinuationToken");
        }
        Ok(page)
    }

    /// `POST /key?uploads` -> upload id.
    pub async fn create_multipart_upload(
        &self,
        key: &str,
        headers: HeaderMap,
    ) -> ApiResult<String> {
        let req = self.request(
            Method::POST,
            self.key_path(key),
            vec![("uploads".to_owned(), String::new())],
            headers,
            None,
        );
        let response = self.send(req).await?;
        let body = String::from_utf8_lossy(&response.body);
        xml::text_of(&body, "UploadId")
            .ok_or_else(|| S3ApiError::Xml("InitiateMultipartUploadResult without UploadId".into()))
    }

    /// `PUT /key?partNumber=N&uploadId=U` with a body -> part ETag.
    pub async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        body: Bytes,
    ) -> ApiResult<String> {
        let req = self.request(
            Method::PUT,
            self.key_path(key),
            vec![
                ("partNumber".to_owned(), part_number.to_string()),
                ("uploadId".to_owned(), uri_encode(upload_id, true)),
            ],
            HeaderMap::new(),
            Some(body),
        );
        let response = self.send(req).await?;
        response
            .headers
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
            .ok_or_else(|| S3ApiError::Xml("upload part response without ETag".into()))
    }

    /// `PUT /key?partNumber=N&uploadId=U` with a copy source and byte
    /// range -> part ETag (carried in the XML body, not the headers).
    pub async fn upload_part_copy(
        &self,
        key: &str,
        upload_id: &str,
        part_number: u32,
        src: &str,
        start: u64,
        len: u64,
    ) -> ApiResult<String> {
        let mut headers = HeaderMap::new();
        insert(&mut headers, "x-amz-copy-source", &self.copy_source(src));
        if len > 0 {
            insert(
                &mut headers,
                "x-amz-copy-source-range",
                &format!("bytes={start}-{}", start + len - 1),
            );
        }
        let req = self.request(
            Method::PUT,
            self.key_path(key),
            vec![
                ("partNumber".to_owned(), part_number.to_string()),
                ("uploadId".to_owned(), uri_encode(upload_id, true)),
            ],
            headers,
            None,
        );
        let response = self.send(req).await?;
        let body = String::from_utf8_lossy(&response.body);
        xml::text_of(&body, "ETag")
            .ok_or_else(|| S3ApiError::Xml("CopyPartResult without ETag".into()))
    }

    /// `POST /key?uploadId=U` with the ordered part list.
    pub async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[(u32, String)],
    ) -> ApiResult<()> {
        let body = xml::complete_multipart_body(parts);
        let req = self.request(
            Method::POST,
            self.key_path(key),
            vec![("uploadId".to_owned(), uri_encode(upload_id, true))],
            HeaderMap::new(),
            Some(Bytes::from(body)),
        );
        let response = self.send(req).await?;
        // Complete can return 200 with an embedded error document.
        let text = String::from_utf8_lossy(&response.body);
        if text.contains("<Error>") {
            let message =
                xml::text_of(&text, "Code").unwrap_or_else(|| "complete failed".into());
            return Err(S3ApiError::Server {
                status: 200,
                message,
            });
        }
        Ok(())
    }

    /// `DELETE /key?uploadId=U`.
    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> ApiResult<()> {
        let req = self.request(
            Method::DELETE,
            self.key_path(key),
            vec![("uploadId".to_owned(), uri_encode(upload_id, true))],
            HeaderMap::new(),
            None,
        );
        self.send(req).await?;
        Ok(())
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(v) = value.parse() {
        headers.insert(name, v);
    }
}
