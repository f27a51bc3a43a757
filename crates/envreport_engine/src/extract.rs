use std::sync::LazyLock;

use envreport_core::EnvironmentMap;
use envreport_logging::{report_debug, report_warn};
use regex::Regex;
use scraper::{Html, Selector};
use serde_json::Value;

/// Attribute that carries the embedded JSON payload.
pub const PAYLOAD_ATTRIBUTE: &str = "data-jsonblob";

// Lazy match up to the first `}` that closes the quoted attribute value. The
// closing brace is consumed by the pattern and re-appended by the caller.
static FALLBACK_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?s)<[A-Za-z][^>]*?\bid\s*=\s*["']data-container["'][^>]*?\bdata-jsonblob\s*=\s*["'](.*?)\}["']"#,
    )
    .expect("fallback pattern is valid")
});

/// Where the payload text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionSource {
    Attribute,
    Fallback,
    None,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractionError {
    #[error("no data-container element and no recoverable payload")]
    MissingPayload,
    #[error("payload is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("payload is JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub env: EnvironmentMap,
    pub source: ExtractionSource,
    pub error: Option<ExtractionError>,
}

impl Extraction {
    fn failed(source: ExtractionSource, error: ExtractionError) -> Self {
        Self {
            env: EnvironmentMap::new(),
            source,
            error: Some(error),
        }
    }
}

pub trait Extractor: Send + Sync {
    /// Never fails: problems degrade to an empty map with `error` set.
    fn extract(&self, html: &str) -> Extraction;
}

/// Reads the `data-jsonblob` attribute of the `data-container` element:
/// - parses the document and takes the first element with that id
/// - when the attribute is missing, blank, or the truncated `{`, scans the raw
///   text with a permissive pattern instead
/// - decodes the recovered text as a JSON object.
#[derive(Debug, Default)]
pub struct DataContainerExtractor;

impl Extractor for DataContainerExtractor {
    fn extract(&self, html: &str) -> Extraction {
        let (text, source) = match attribute_payload(html) {
            Some(text) if is_usable(&text) => (text, ExtractionSource::Attribute),
            candidate => {
                report_warn!(
                    "data-jsonblob attribute unusable ({}), falling back to pattern scan",
                    describe_candidate(candidate.as_deref())
                );
                match fallback_payload(html) {
                    Some(text) => (text, ExtractionSource::Fallback),
                    None => {
                        report_warn!("pattern scan found no data-jsonblob payload");
                        return Extraction::failed(
                            ExtractionSource::None,
                            ExtractionError::MissingPayload,
                        );
                    }
                }
            }
        };

        match parse_environment(&text) {
            Ok(env) => {
                report_debug!("extracted {} top-level keys via {:?}", env.len(), source);
                Extraction {
                    env,
                    source,
                    error: None,
                }
            }
            Err(err) => {
                report_warn!("extracted data-jsonblob rejected: {}", err);
                Extraction::failed(source, err)
            }
        }
    }
}

fn attribute_payload(html: &str) -> Option<String> {
    let doc = Html::parse_document(html);
    let selector = Selector::parse(r#"[id="data-container"]"#).ok()?;
    let container = doc.select(&selector).next()?;
    container.value().attr(PAYLOAD_ATTRIBUTE).map(str::to_string)
}

fn is_usable(candidate: &str) -> bool {
    let trimmed = candidate.trim();
    !trimmed.is_empty() && trimmed != "{"
}

fn describe_candidate(candidate: Option<&str>) -> &'static str {
    match candidate.map(str::trim) {
        None => "missing",
        Some("") => "empty",
        Some(_) => "truncated",
    }
}

fn fallback_payload(html: &str) -> Option<String> {
    let captures = FALLBACK_PATTERN.captures(html)?;
    let body = captures.get(1)?.as_str();
    Some(unescape_entities(&format!("{body}}}")))
}

/// Undo the handful of entities a serializer puts into attribute values.
fn unescape_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&quot;", "\"")
        .replace("&#34;", "\"")
        .replace("&#x22;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

fn parse_environment(text: &str) -> Result<EnvironmentMap, ExtractionError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|err| ExtractionError::InvalidJson(err.to_string()))?;
    match value {
        Value::Object(map) => Ok(map),
        Value::Array(_) => Err(ExtractionError::NotAnObject("array")),
        Value::String(_) => Err(ExtractionError::NotAnObject("string")),
        Value::Number(_) => Err(ExtractionError::NotAnObject("number")),
        Value::Bool(_) => Err(ExtractionError::NotAnObject("boolean")),
        Value::Null => Err(ExtractionError::NotAnObject("null")),
    }
}
