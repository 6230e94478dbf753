use std::collections::{BTreeMap, HashMap};

use scraper::{Html, Selector};
use url::Url;

use crate::filename::extension_from_url;
use crate::normalize::{is_external, normalize_for_match, resolve_candidate, Candidate, MatchOptions};
use crate::types::{ResourceReference, ResourceType};

#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    pub base_url: Option<String>,
    pub external_only: bool,
    pub match_options: MatchOptions,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionOutput {
    /// Deduplicated references in first-seen document order.
    pub references: Vec<ResourceReference>,
    /// Non-fatal anomalies: tolerated markup errors, unresolvable hrefs,
    /// an unusable base URL.
    pub parse_errors: Vec<String>,
}

impl ExtractionOutput {
    pub fn by_type(&self) -> BTreeMap<ResourceType, Vec<&ResourceReference>> {
        let mut map: BTreeMap<ResourceType, Vec<&ResourceReference>> = BTreeMap::new();
        for reference in &self.references {
            map.entry(reference.resource_type).or_default().push(reference);
        }
        map
    }

    pub fn type_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for reference in &self.references {
            *counts.entry(reference.resource_type.label().to_string()).or_default() += 1;
        }
        counts
    }

    pub fn element_count(&self) -> usize {
        self.references.iter().map(|r| r.originating_elements.len()).sum()
    }
}

/// Scans markup for hyperlink-referenced documents.
///
/// Only `href` targets of anchor elements are candidates; inline image and
/// background references are never extracted. Duplicate URLs collapse into
/// one reference retaining every originating element. Malformed markup never
/// aborts the scan: this is a pure, deterministic function of
/// (markup, options) whose anomalies surface as `parse_errors`.
pub fn extract_references(markup: &str, options: &ExtractOptions) -> ExtractionOutput {
    let mut output = ExtractionOutput::default();
    let document = Html::parse_document(markup);
    output
        .parse_errors
        .extend(document.errors.iter().map(|e| e.to_string()));

    let base = match options.base_url.as_deref() {
        Some(raw) => match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(err) => {
                output.parse_errors.push(format!("invalid base url {raw}: {err}"));
                None
            }
        },
        None => None,
    };

    let Ok(anchor_sel) = Selector::parse("a[href]") else {
        return output;
    };

    let mut seen: HashMap<String, usize> = HashMap::new();
    for (position, element) in document.select(&anchor_sel).enumerate() {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let url = match resolve_candidate(href, base.as_ref()) {
            Candidate::Url(url) => url,
            Candidate::Skipped => continue,
            Candidate::Unresolvable(reason) => {
                output.parse_errors.push(format!("unresolvable href: {reason}"));
                continue;
            }
        };

        let extension = extension_from_url(&url);
        let mime_hint = element.value().attr("type");
        let Some(resource_type) = detect_type(&url, extension.as_deref(), mime_hint) else {
            continue;
        };

        let external = is_external(&url, base.as_ref());
        if options.external_only && !external {
            continue;
        }

        let key = normalize_for_match(url.as_str(), &options.match_options);
        let snippet = element.html();
        match seen.get(&key) {
            Some(&index) => output.references[index].originating_elements.push(snippet),
            None => {
                seen.insert(key.clone(), output.references.len());
                output.references.push(ResourceReference {
                    source_text: href.trim().to_string(),
                    url: url.into(),
                    normalized_url: key,
                    resource_type,
                    file_extension: extension,
                    is_external: external,
                    originating_elements: vec![snippet],
                    ordinal: position,
                });
            }
        }
    }

    log::debug!(
        "extracted {} references ({} elements, {} parse notes)",
        output.references.len(),
        output.element_count(),
        output.parse_errors.len()
    );
    output
}

/// Type detection order: extension, then the anchor's `type` attribute as a
/// MIME hint, then a path-keyword heuristic. Candidates nothing recognizes
/// are not document links.
fn detect_type(url: &Url, extension: Option<&str>, mime_hint: Option<&str>) -> Option<ResourceType> {
    if let Some(found) = extension.and_then(type_for_extension) {
        return Some(found);
    }
    if let Some(found) = mime_hint.and_then(type_for_mime) {
        return Some(found);
    }
    path_keyword_type(url)
}

fn type_for_extension(ext: &str) -> Option<ResourceType> {
    let found = match ext.to_ascii_lowercase().as_str() {
        "pdf" => ResourceType::Pdf,
        "doc" | "docx" | "rtf" | "odt" | "txt" => ResourceType::Document,
        "xls" | "xlsx" | "csv" | "ods" => ResourceType::Spreadsheet,
        "ppt" | "pptx" | "odp" => ResourceType::Presentation,
        _ => return None,
    };
    Some(found)
}

fn type_for_mime(mime: &str) -> Option<ResourceType> {
    let essence = mime.split(';').next().unwrap_or(mime).trim().to_ascii_lowercase();
    let found = match essence.as_str() {
        "application/pdf" => ResourceType::Pdf,
        "application/msword"
        | "application/rtf"
        | "text/rtf"
        | "application/vnd.oasis.opendocument.text"
        | "text/plain" => ResourceType::Document,
        "application/vnd.ms-excel" | "text/csv" | "application/vnd.oasis.opendocument.spreadsheet" => {
            ResourceType::Spreadsheet
        }
        "application/vnd.ms-powerpoint" | "application/vnd.oasis.opendocument.presentation" => {
            ResourceType::Presentation
        }
        _ if essence.contains("wordprocessingml") => ResourceType::Document,
        _ if essence.contains("spreadsheetml") => ResourceType::Spreadsheet,
        _ if essence.contains("presentationml") => ResourceType::Presentation,
        _ => return None,
    };
    Some(found)
}

/// Extensionless download endpoints (`/download/123`, `/attachments/9`) are
/// kept with an unknown type rather than dropped.
fn path_keyword_type(url: &Url) -> Option<ResourceType> {
    let segments = url.path_segments()?;
    for segment in segments {
        let lower = segment.to_ascii_lowercase();
        if lower.contains("download")
            || lower.contains("attachment")
            || lower.contains("document")
            || lower == "file"
            || lower == "files"
        {
            return Some(ResourceType::Unknown);
        }
    }
    None
}
