//! Request matching logic.
//!
//! Matches intercepted requests against a rule snapshot. Matching is pure:
//! the same request and snapshot always select the same rule.

use crate::rules::{CompiledPattern, ExactTarget, MappingRule, RuleSet};
use chrono::{DateTime, Utc};
use std::ops::Range;
use std::sync::Arc;
use url::Position;

/// The parts of a request the matcher looks at.
#[derive(Debug, Clone)]
pub struct RequestTarget {
    pub method: String,
    /// Normalised URL (lower-case host) when parseable, otherwise the raw string
    pub url: String,
    parsed: Option<ExactTarget>,
    /// Byte range of the host within `url`
    host_span: Option<Range<usize>>,
}

impl RequestTarget {
    pub fn new(method: &str, raw_url: &str) -> Self {
        match url::Url::parse(raw_url) {
            Ok(url) => {
                let parsed = url.host_str().map(|host| ExactTarget {
                    scheme: url.scheme().to_string(),
                    host: host.to_ascii_lowercase(),
                    port: url.port_or_known_default(),
                    path: url.path().to_string(),
                    query: url.query().map(str::to_string),
                });
                let host_span = url
                    .host_str()
                    .map(|_| url[..Position::BeforeHost].len()..url[..Position::AfterHost].len());
                Self {
                    method: method.to_uppercase(),
                    url: url.to_string(),
                    parsed,
                    host_span,
                }
            }
            Err(_) => Self {
                method: method.to_uppercase(),
                url: raw_url.to_string(),
                parsed: None,
                host_span: None,
            },
        }
    }
}

/// Result of matching a request against a snapshot.
#[derive(Debug, Clone)]
pub struct MatchResult {
    /// The matched rule, if any
    pub rule: Option<Arc<MappingRule>>,
    pub matched_at: DateTime<Utc>,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        self.rule.is_some()
    }

    pub fn rule_id(&self) -> Option<&str> {
        self.rule.as_ref().map(|r| r.id.as_str())
    }
}

/// Find the first enabled rule matching the request.
///
/// Snapshot rules are already in priority order, so the first hit wins.
pub fn find_match(request: &RequestTarget, snapshot: &RuleSet) -> MatchResult {
    let rule = snapshot
        .rules
        .iter()
        .filter(|rule| rule.enabled)
        .find(|rule| rule.matches(request))
        .cloned();

    MatchResult {
        rule,
        matched_at: Utc::now(),
    }
}

impl MappingRule {
    /// Whether this rule applies to the request (ignores `enabled`).
    pub fn matches(&self, request: &RequestTarget) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| *m == request.method) {
            return false;
        }
        self.pattern.matches(request, self.ignore_case)
    }
}

impl CompiledPattern {
    pub fn matches(&self, request: &RequestTarget, ignore_case: bool) -> bool {
        match self {
            CompiledPattern::Exact(target) => request
                .parsed
                .as_ref()
                .map(|actual| exact_matches(target, actual, ignore_case))
                .unwrap_or(false),
            CompiledPattern::Contains(needle) => {
                if ignore_case {
                    request.url.to_lowercase().contains(needle.as_str())
                } else {
                    contains_folding_host(&request.url, request.host_span.as_ref(), needle)
                }
            }
            CompiledPattern::Wildcard(glob) => glob.is_match(&request.url),
            CompiledPattern::Regex(regex) => regex.is_match(&request.url),
        }
    }
}

/// Substring search where bytes inside the host compare case-insensitively.
fn contains_folding_host(haystack: &str, host: Option<&Range<usize>>, needle: &str) -> bool {
    let Some(host) = host else {
        return haystack.contains(needle);
    };
    let (hay, pat) = (haystack.as_bytes(), needle.as_bytes());
    if pat.len() > hay.len() {
        return false;
    }
    (0..=hay.len() - pat.len()).any(|start| {
        pat.iter().enumerate().all(|(offset, byte)| {
            let pos = start + offset;
            if host.contains(&pos) {
                hay[pos].eq_ignore_ascii_case(byte)
            } else {
                hay[pos] == *byte
            }
        })
    })
}

fn exact_matches(expected: &ExactTarget, actual: &ExactTarget, ignore_case: bool) -> bool {
    if expected.scheme != actual.scheme
        || expected.host != actual.host
        || expected.port != actual.port
    {
        return false;
    }

    let fold = |s: &str| {
        if ignore_case {
            s.to_lowercase()
        } else {
            s.to_string()
        }
    };

    if expected.path != fold(&actual.path) {
        return false;
    }

    // A pattern without a query matches any query string
    match &expected.query {
        Some(query) => actual.query.as_deref().map(fold).as_ref() == Some(query),
        None => true,
    }
}
