//! Builds replacement responses from local file content.
//!
//! The one invariant that matters here: the declared `Content-Length` always
//! equals the number of body bytes, and nothing else in the header block
//! (chunked framing, a stale encoding, old validators) contradicts the body.

use crate::exchange::{Headers, HttpResponse};
use crate::resolver::FileEntry;
use crate::rules::MappingRule;
use bytes::Bytes;
use tracing::trace;

/// Headers describing the original body that no longer apply.
const STALE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "content-encoding",
    "etag",
    "last-modified",
    "content-range",
    "content-md5",
    "digest",
    "accept-ranges",
];

/// Headers a rule may never set itself; they must describe the file body.
const BODY_HEADERS: &[&str] = &["content-length", "transfer-encoding", "content-encoding"];

/// The response sent to the client in place of the original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplacementResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

impl From<ReplacementResponse> for HttpResponse {
    fn from(r: ReplacementResponse) -> Self {
        HttpResponse::new(r.status, r.headers, r.body)
    }
}

/// Turns a resolved file into a replacement response.
#[derive(Debug, Clone)]
pub struct ResponseSubstitutor {
    default_status: u16,
}

impl ResponseSubstitutor {
    pub fn new(default_status: u16) -> Self {
        Self { default_status }
    }

    /// Build the replacement for `original` (if the upstream already answered).
    ///
    /// Headers of the original response are kept unless they describe the
    /// old body. A `HEAD` request gets the headers of the `GET` answer and an
    /// empty body.
    pub fn substitute(
        &self,
        method: &str,
        original: Option<&HttpResponse>,
        rule: &MappingRule,
        entry: &FileEntry,
    ) -> ReplacementResponse {
        let status = rule.status_override.unwrap_or(self.default_status);

        let mut headers: Headers = original
            .map(|r| {
                r.headers
                    .iter()
                    .filter(|(name, _)| !is_one_of(name, STALE_HEADERS))
                    .collect()
            })
            .unwrap_or_default();

        let content_type = rule.mime_override.as_deref().unwrap_or(&entry.mime_type);
        headers.set("Content-Type", content_type);

        if let Some(encoding) = &entry.content_encoding {
            headers.set("Content-Encoding", encoding.as_str());
        }

        for (name, value) in &rule.headers {
            if is_one_of(name, BODY_HEADERS) {
                trace!(rule_id = %rule.id, header = %name, "Ignoring body header from rule");
                continue;
            }
            headers.set(name, value.as_str());
        }

        let body = if allows_body(status) {
            headers.set("Content-Length", entry.content.len().to_string());
            if method.eq_ignore_ascii_case("HEAD") {
                Bytes::new()
            } else {
                entry.content.clone()
            }
        } else {
            Bytes::new()
        };

        ReplacementResponse {
            status,
            headers,
            body,
        }
    }
}

fn is_one_of(name: &str, list: &[&str]) -> bool {
    list.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// 1xx, 204 and 304 responses never carry a body.
fn allows_body(status: u16) -> bool {
    !(100..200).contains(&status) && status != 204 && status != 304
}
