//! Request signing.
//!
//! The client is polymorphic over a small capability set (body hashing,
//! HMAC and request signing), so TLS/credential backends can differ
//! without touching request construction. [`SigV4Signer`] is the standard
//! implementation; [`AnonymousSigner`] leaves requests unsigned for public
//! buckets and test servers.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac as _};
use secrecy::{ExposeSecret as _, SecretString};
use sha2::{Digest as _, Sha256};

/// Hash of the empty body, precomputed.
const EMPTY_BODY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Capability set for authenticating requests.
pub trait Signer: Send + Sync + 'static {
    /// Hex digest of the request body as carried in `x-amz-content-sha256`.
    fn hash_body(&self, body: &[u8]) -> String;

    /// Keyed MAC used by the signature derivation chain.
    fn compute_hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8>;

    /// Add authentication headers to `req` for the given instant.
    fn sign_request(&self, req: &mut crate::S3Request, now: DateTime<Utc>);
}

/// Static credential set.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub access_key: String,
    pub secret_key: SecretString,
    /// STS session token, when the credentials are temporary.
    pub session_token: Option<SecretString>,
}

/// AWS signature version 4 over HMAC-SHA256.
pub struct SigV4Signer {
    credentials: Credentials,
    region: String,
    service: &'static str,
}

impl SigV4Signer {
    pub fn new(credentials: Credentials, region: impl Into<String>) -> Self {
        Self {
            credentials,
            region: region.into(),
            service: "s3",
        }
    }

    fn scope(&self, date: &str) -> String {
        format!("{date}/{}/{}/aws4_request", self.region, self.service)
    }

    fn signing_key(&self, date: &str) -> Vec<u8> {
        let secret = format!("AWS4{}", self.credentials.secret_key.expose_secret());
        let k_date = self.compute_hmac(secret.as_bytes(), date.as_bytes());
        let k_region = self.compute_hmac(&k_date, self.region.as_bytes());
        let k_service = self.compute_hmac(&k_region, self.service.as_bytes());
        self.compute_hmac(&k_service, b"aws4_request")
    }
}

impl Signer for SigV4Signer {
    fn hash_body(&self, body: &[u8]) -> String {
        if body.is_empty() {
            EMPTY_BODY_SHA256.to_owned()
        } else {
            hex::encode(Sha256::digest(body))
        }
    }

    fn compute_hmac(&self, key: &[u8], data: &[u8]) -> Vec<u8> {
        let mut mac = Hmac::<Sha256>::new_from_slice(key)
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(data);
        mac.finalize().into_bytes().to_vec()
    }

    fn sign_request(&self, req: &mut crate::S3Request, now: DateTime<Utc>) {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let payload_hash = self.hash_body(req.body.as_deref().unwrap_or_default());

        let host = req
            .endpoint
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .to_owned();
        insert_header(req, "host", &host);
        insert_header(req, "x-amz-date", &amz_date);
        insert_header(req, "x-amz-content-sha256", &payload_hash);
        if let Some(token) = &self.credentials.session_token {
            insert_header(req, "x-amz-security-token", token.expose_secret());
        }

        // Canonical headers: host plus every x-amz-* header, sorted.
        let mut canonical: Vec<(String, String)> = req
            .headers
            .iter()
            .filter(|(name, _)| {
                let n = name.as_str();
                n == "host" || n.starts_with("x-amz-")
            })
            .map(|(name, value)| {
                (
                    name.as_str().to_owned(),
                    value.to_str().unwrap_or_default().trim().to_owned(),
                )
            })
            .collect();
        canonical.sort();
        let signed_headers: String = canonical
            .iter()
            .map(|(n, _)| n.as_str())
            .collect::<Vec<_>>()
            .join(";");
        let canonical_headers: String = canonical
            .iter()
            .map(|(n, v)| format!("{n}:{v}\n"))
            .collect();

        let canonical_query: String = {
            let mut params = req.query.clone();
            params.sort();
            params
                .iter()
                .map(|(k, v)| format!("{}={}", uri_encode(k, true), uri_encode(v, true)))
                .collect::<Vec<_>>()
                .join("&")
        };

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            req.method.as_str(),
            req.path,
            canonical_query,
            canonical_headers,
            signed_headers,
            payload_hash,
        );

        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            self.scope(&date),
            hex::encode(Sha256::digest(canonical_request.as_bytes())),
        );

        let signature = hex::encode(self.compute_hmac(
            &self.signing_key(&date),
            string_to_sign.as_bytes(),
        ));

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.credentials.access_key,
            self.scope(&date),
            signed_headers,
            signature,
        );
        insert_header(req, "authorization", &authorization);
    }
}

/// No authentication; requests go out as-is.
pub struct AnonymousSigner;

impl Signer for AnonymousSigner {
    fn hash_body(&self, body: &[u8]) -> String {
        if body.is_empty() {
            EMPTY_BODY_SHA256.to_owned()
        } else {
            hex::encode(Sha256::digest(body))
        }
    }

    fn compute_hmac(&self, _key: &[u8], _data: &[u8]) -> Vec<u8> {
        Vec::new()
    }

    fn sign_request(&self, _req: &mut crate::S3Request, _now: DateTime<Utc>) {}
}

fn insert_header(req: &mut crate::S3Request, name: &'static str, value: &str) {
    if let Ok(v) = http::HeaderValue::from_str(value) {
        req.headers.insert(name, v);
    }
}

/// AWS-style percent encoding: unreserved characters pass through, `/` is
/// kept in paths but encoded in query values.
pub fn uri_encode(input: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
