use url::Url;

/// Matching options shared by the extractor (mapping keys) and the rewriter
/// (match keys). Both sides must canonicalize with the same rules or the
/// mapping never matches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchOptions {
    pub case_sensitive: bool,
    pub normalize_urls: bool,
    pub match_query_params: bool,
    pub match_fragments: bool,
}

impl Default for MatchOptions {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            normalize_urls: true,
            match_query_params: true,
            match_fragments: false,
        }
    }
}

/// Outcome of turning a raw href into an absolute URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Candidate {
    /// An absolute http(s) URL.
    Url(Url),
    /// Not a document candidate at all (fragment, mailto:, tel:,
    /// javascript:, data:, non-http scheme, empty).
    Skipped,
    /// Relative reference that could not be resolved (no base URL, or the
    /// base join failed).
    Unresolvable(String),
}

const SKIPPED_SCHEMES: &[&str] = &["mailto:", "tel:", "javascript:", "data:"];

/// Resolves a raw href into an absolute http(s) URL.
///
/// Protocol-relative references are upgraded to `https:`. Relative
/// references are joined against `base` when one is available.
pub fn resolve_candidate(raw: &str, base: Option<&Url>) -> Candidate {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Candidate::Skipped;
    }
    if trimmed.starts_with('#') || trimmed.starts_with('?') {
        return Candidate::Skipped;
    }
    let lower = trimmed.to_ascii_lowercase();
    if SKIPPED_SCHEMES.iter().any(|s| lower.starts_with(s)) {
        return Candidate::Skipped;
    }
    if trimmed.starts_with("//") {
        return match Url::parse(&format!("https:{trimmed}")) {
            Ok(url) => Candidate::Url(url),
            Err(err) => Candidate::Unresolvable(format!("{trimmed}: {err}")),
        };
    }
    match Url::parse(trimmed) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Candidate::Url(url),
        Ok(_) => Candidate::Skipped,
        Err(url::ParseError::RelativeUrlWithoutBase) => match base {
            Some(base) => match base.join(trimmed) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => Candidate::Url(url),
                Ok(_) => Candidate::Skipped,
                Err(err) => Candidate::Unresolvable(format!("{trimmed}: {err}")),
            },
            None => Candidate::Unresolvable(format!("{trimmed}: relative without base url")),
        },
        Err(err) => Candidate::Unresolvable(format!("{trimmed}: {err}")),
    }
}

/// A reference is external when its host differs from the base URL's host.
/// With no base there is nothing to be internal to, so every absolute URL
/// counts as external.
pub fn is_external(url: &Url, base: Option<&Url>) -> bool {
    match (url.host_str(), base.and_then(Url::host_str)) {
        (Some(host), Some(base_host)) => !host.eq_ignore_ascii_case(base_host),
        _ => true,
    }
}

/// Canonicalizes a URL string for comparison: percent-decode, drop the
/// fragment (and optionally the query), trim the trailing slash, case-fold.
///
/// Never fails; unparseable input falls through a best-effort text path so
/// that the same garbage on both sides still compares equal.
pub fn normalize_for_match(raw: &str, options: &MatchOptions) -> String {
    let trimmed = raw.trim();
    if !options.normalize_urls {
        return fold_case(trimmed.to_string(), options);
    }

    let mut serialized = match Url::parse(trimmed) {
        Ok(mut url) => {
            if !options.match_fragments {
                url.set_fragment(None);
            }
            if !options.match_query_params {
                url.set_query(None);
            }
            let path = url.path().to_string();
            if path.len() > 1 && path.ends_with('/') {
                url.set_path(path.trim_end_matches('/'));
            }
            url.to_string()
        }
        Err(_) => trimmed.to_string(),
    };

    serialized = percent_decode_lossy(&serialized);
    while serialized.ends_with('/') {
        serialized.pop();
    }
    fold_case(serialized, options)
}

/// Percent-decodes, falling back to the input when the decoded bytes are not
/// valid UTF-8.
pub(crate) fn percent_decode_lossy(input: &str) -> String {
    match urlencoding::decode(input) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => input.to_string(),
    }
}

fn fold_case(value: String, options: &MatchOptions) -> String {
    if options.case_sensitive {
        value
    } else {
        value.to_lowercase()
    }
}
