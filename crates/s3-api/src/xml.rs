//! Tolerant extraction and generation of the handful of XML shapes the S3
//! protocol uses.
//!
//! The responses involved (`InitiateMultipartUploadResult`,
//! `ListBucketResult`, `CopyPartResult`, error bodies) are flat and
//! namespace-free in practice, so a forgiving tag scanner does the job
//! without a parser dependency.

/// Text content of the first `<tag>...</tag>`, entity-decoded.
pub fn text_of(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    Some(unescape(&body[start..end]))
}

/// Contents of every `<tag>...</tag>` block, in order.
pub fn blocks_of<'a>(body: &'a str, tag: &str) -> Vec<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let mut out = Vec::new();
    let mut cursor = 0;
    while let Some(found) = body[cursor..].find(&open) {
        let start = cursor + found + open.len();
        let Some(len) = body[start..].find(&close) else {
            break;
        };
        out.push(&body[start..start + len]);
        cursor = start + len + close.len();
    }
    out
}

fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        let Some(end) = rest.find(';') else {
            out.push_str(rest);
            return out;
        };
        match &rest[..=end] {
            "&amp;" => out.push('&'),
            "&lt;" => out.push('<'),
            "&gt;" => out.push('>'),
            "&quot;" => out.push('"'),
            "&apos;" => out.push('\''),
            entity => {
                let decoded = entity
                    .strip_prefix("&#x")
                    .and_then(|h| u32::from_str_radix(h.trim_end_matches(';'), 16).ok())
                    .or_else(|| {
                        entity
                            .strip_prefix("&#")
                            .and_then(|d| d.trim_end_matches(';').parse().ok())
                    })
                    .and_then(char::from_u32);
                match decoded {
                    Some(c) => out.push(c),
                    None => out.push_str(entity),
                }
            }
        }
        rest = &rest[end + 1..];
    }
    out.push_str(rest);
    out
}

pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

/// Body for `POST ?uploadId=U`: parts in ascending part-number order.
pub fn complete_multipart_body(parts: &[(u32, String)]) -> String {
    let mut body = String::from("<CompleteMultipartUpload>");
    for (number, etag) in parts {
        body.push_str(&format!(
            "<Part><PartNumber>{number}</PartNumber><ETag>{}</ETag></Part>",
            escape(etag)
        ));
    }
    body.push_str("</CompleteMultipartUpload>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_upload_id() {
        let body = r#"<?xml version="1.0"?>
            <InitiateMultipartUploadResult>
              <Bucket>b</Bucket><Key>k</Key>
              <UploadId>VXBsb2FkSWQ</UploadId>
            </InitiateMultipartUploadResult>"#;
        assert_eq!(text_of(body, "UploadId").as_deref(), Some("VXBsb2FkSWQ"));
        assert_eq!(text_of(body, "Missing"), None);
    }

    #[test]
    fn entity_decoding() {
        assert_eq!(
            text_of("<Key>a&amp;b &lt;c&gt; &#x2F;d</Key>", "Key").as_deref(),
            Some("a&b <c> /d")
        );
    }

    #[test]
    fn repeated_blocks() {
        let body = "<Contents><Key>a</Key></Contents><Contents><Key>b</Key></Contents>";
        let blocks = blocks_of(body, "Contents");
        assert_eq!(blocks.len(), 2);
        assert_eq!(text_of(blocks[1], "Key").as_deref(), Some("b"));
    }

    #[test]
    fn complete_body_preserves_order() {
        let body = complete_multipart_body(&[
            (1, "\"e1\"".into()),
            (2, "\"e2\"".into()),
        ]);
        assert_eq!(
            body,
            "<CompleteMultipartUpload>\
             <Part><PartNumber>1</PartNumber><ETag>&quot;e1&quot;</ETag></Part>\
             <Part><PartNumber>2</PartNumber><ETag>&quot;e2&quot;</ETag></Part>\
             </CompleteMultipartUpload>"
        );
    }
}
