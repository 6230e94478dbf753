use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;
use std::time::Instant;

use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::normalize::{normalize_for_match, MatchOptions};
use crate::types::UrlMapping;

/// Matches the href attribute inside an anchor tag, capturing the value
/// whether double-quoted, single-quoted, or bare.
static HREF_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\b[^>]*?\bhref\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#)
        .unwrap_or_else(|e| panic!("invalid href regex: {e}"))
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WarningKind {
    UrlNotFound,
    MalformedUrl,
    EncodingIssue,
}

impl fmt::Display for WarningKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WarningKind::UrlNotFound => "url-not-found",
            WarningKind::MalformedUrl => "malformed-url",
            WarningKind::EncodingIssue => "encoding-issue",
        };
        f.write_str(name)
    }
}

/// Non-fatal anomaly noticed while rewriting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementWarning {
    pub kind: WarningKind,
    pub detail: String,
}

impl fmt::Display for ReplacementWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewriteStatistics {
    pub total_mappings: usize,
    pub successful_replacements: usize,
    pub unmatched_mappings: usize,
    pub modified_elements: usize,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteOutput {
    pub markup: String,
    /// Unique mapping keys that matched at least one element.
    pub replacement_count: usize,
    /// Mapping entries that never matched — a diagnostic signal, not an
    /// error.
    pub unreplaced_urls: Vec<String>,
    pub statistics: RewriteStatistics,
    pub warnings: Vec<ReplacementWarning>,
}

/// Replaces hyperlink targets that match the mapping.
///
/// A single sequential pass over the raw markup: only matched href values
/// are spliced, so every other attribute and all surrounding content is
/// preserved byte-for-byte. Hrefs and mapping keys are canonicalized with
/// the same rules before comparison, so output is deterministic given a
/// finished mapping. Never fails; malformed input yields a well-formed
/// result carrying warnings.
pub fn rewrite_links(markup: &str, mapping: &UrlMapping, options: &MatchOptions) -> RewriteOutput {
    let started = Instant::now();
    let mut warnings = Vec::new();

    // Canonicalize mapping keys once, up front.
    let lookup: std::collections::BTreeMap<String, &str> = mapping
        .iter()
        .map(|(key, target)| (normalize_for_match(key, options), target.as_str()))
        .collect();

    let mut used: BTreeSet<String> = BTreeSet::new();
    let mut modified_elements = 0usize;
    let mut out = String::with_capacity(markup.len());
    let mut cursor = 0usize;

    for caps in HREF_PATTERN.captures_iter(markup) {
        let Some(value) = caps.get(1).or_else(|| caps.get(2)).or_else(|| caps.get(3)) else {
            continue;
        };
        let raw = value.as_str();
        let unescaped = unescape_ampersands(raw);
        if urlencoding::decode(&unescaped).is_err() {
            warnings.push(ReplacementWarning {
                kind: WarningKind::EncodingIssue,
                detail: raw.to_string(),
            });
        }
        let key = normalize_for_match(&unescaped, options);
        match lookup.get(&key) {
            Some(target) => {
                out.push_str(&markup[cursor..value.start()]);
                out.push_str(&escape_attribute(target));
                cursor = value.end();
                used.insert(key);
                modified_elements += 1;
            }
            None => {
                if unescaped.contains("://") && Url::parse(unescaped.trim()).is_err() {
                    warnings.push(ReplacementWarning {
                        kind: WarningKind::MalformedUrl,
                        detail: raw.to_string(),
                    });
                }
            }
        }
    }
    out.push_str(&markup[cursor..]);

    let mut replacement_count = 0usize;
    let mut unreplaced_urls = Vec::new();
    for key in mapping.keys() {
        if used.contains(&normalize_for_match(key, options)) {
            replacement_count += 1;
        } else {
            unreplaced_urls.push(key.clone());
            warnings.push(ReplacementWarning {
                kind: WarningKind::UrlNotFound,
                detail: key.clone(),
            });
        }
    }

    let statistics = RewriteStatistics {
        total_mappings: mapping.len(),
        successful_replacements: replacement_count,
        unmatched_mappings: unreplaced_urls.len(),
        modified_elements,
        processing_time_ms: started.elapsed().as_millis() as u64,
    };
    log::debug!(
        "rewrote {} elements for {}/{} mapping entries",
        modified_elements,
        replacement_count,
        mapping.len()
    );

    RewriteOutput {
        markup: out,
        replacement_count,
        unreplaced_urls,
        statistics,
        warnings,
    }
}

fn unescape_ampersands(value: &str) -> String {
    value.replace("&amp;", "&")
}

fn escape_attribute(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
