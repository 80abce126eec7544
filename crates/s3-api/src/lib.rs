//! Minimal S3 REST client for bucketfs.
//!
//! Transport ([`HttpClient`]) and authentication ([`sign::Signer`]) are
//! pluggable; [`S3Client`] only knows how to build the object and
//! multipart requests and interpret their responses.

mod backends;
mod client;
mod error;
mod http_client;
pub mod sign;
pub mod xml;

pub use backends::ReqwestClient;
pub use client::{ListedObject, ListingPage, S3Client, S3Config};
pub use error::{HttpClientError, S3ApiError};
pub use http_client::{HttpClient, S3Request, S3Response};
