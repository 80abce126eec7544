//! HTTP client abstraction for pluggable backends.
//!
//! The client builds [`S3Request`]s (path + query, never a pre-baked URL,
//! so the signer can canonicalize them) and hands them to an
//! [`HttpClient`] implementation for transport.

use std::future::Future;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};

use crate::error::HttpClientError;

/// An S3 request before transport: method, key path, canonical query
/// parameters, headers and optional body.
#[derive(Debug, Clone)]
pub struct S3Request {
    pub method: Method,
    /// Scheme + authority, e.g. `https://s3.eu-central-1.amazonaws.com`.
    pub endpoint: String,
    /// Absolute path, percent-encoded, starting with `/`.
    pub path: String,
    /// Query parameters in canonical (sorted) order. An empty value means
    /// a bare parameter (`?uploads`).
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl S3Request {
    /// The full URL for transport.
    pub fn url(&self) -> String {
        let mut url = format!("{}{}", self.endpoint, self.path);
        let mut sep = '?';
        for (k, v) in &self.query {
            if v.is_empty() {
                url.push(sep);
                url.push_str(k);
            } else {
                url.push(sep);
                url.push_str(k);
                url.push('=');
                url.push_str(v);
            }
            sep = '&';
        }
        url
    }
}

/// An HTTP response returned by an [`HttpClient`] implementation.
#[derive(Debug)]
pub struct S3Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Trait for pluggable HTTP client backends (RPITIT, no macro).
pub trait HttpClient: Send + Sync + 'static {
    /// Send a request and collect the full response.
    fn send(
        &self,
        request: S3Request,
    ) -> impl Future<Output = Result<S3Response, HttpClientError>> + Send;
}
