use serde_json::Value;

use super::grounding;
use super::Citation;
use crate::error::CitationError;

/// Keys that may carry a result's URL, in preference order.
pub(super) const URL_KEYS: &[&str] = &[
    "url",
    "website_url",
    "link",
    "href",
    "source_url",
    "reference_url",
    "displayUrl",
    "webSearchUrl",
];

const INTERNAL_TITLE: &str = "Internal document search results";

/// One recognizable payload shape.
///
/// `Ok(None)` means the payload is not this shape and the next strategy
/// should look at it. `Ok(Some(..))` claims the payload, even when it holds
/// no usable citation.
pub trait CitationStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, payload: &Value) -> Result<Option<Vec<Citation>>, CitationError>;
}

pub(super) fn first_string<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .filter_map(|k| value.get(*k).and_then(Value::as_str))
        .map(str::trim)
        .find(|s| !s.is_empty())
}

/// Web citation from a result object, or `None` when it has no URL.
fn web_from_object(item: &Value) -> Option<Citation> {
    let url = first_string(item, URL_KEYS)?;
    let title = first_string(item, &["name", "title"]).unwrap_or(url);
    Some(Citation::web(title, url))
}

/// `{"results": [{"url": .., "name": ..}, ..]}` as returned by search tools.
pub struct ResultsArray;

impl CitationStrategy for ResultsArray {
    fn name(&self) -> &'static str {
        "results_array"
    }

    fn extract(&self, payload: &Value) -> Result<Option<Vec<Citation>>, CitationError> {
        let Some(results) = payload.get("results") else {
            return Ok(None);
        };
        let results = results.as_array().ok_or_else(|| CitationError::InvalidPayload {
            strategy: self.name(),
            reason: "`results` is not an array".into(),
        })?;
        Ok(Some(results.iter().filter_map(web_from_object).collect()))
    }
}

/// Research reports list their sources under `citations`, `sources` or
/// `references`, either as bare URLs or as objects.
pub struct ResearchReport;

impl CitationStrategy for ResearchReport {
    fn name(&self) -> &'static str {
        "research_report"
    }

    fn extract(&self, payload: &Value) -> Result<Option<Vec<Citation>>, CitationError> {
        let Some(items) = ["citations", "sources", "references"]
            .iter()
            .find_map(|k| payload.get(*k).and_then(Value::as_array))
        else {
            return Ok(None);
        };

        let citations = items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if s.starts_with("http://") || s.starts_with("https://") => {
                    Some(Citation::web(s.as_str(), s.as_str()))
                }
                Value::Object(_) => web_from_object(item),
                _ => None,
            })
            .collect();
        Ok(Some(citations))
    }
}

/// The agent service's hosted index search. It reports no per-document
/// detail, so one internal citation stands for the whole search.
pub struct InternalSearchMarker {
    index_name: Option<String>,
}

impl InternalSearchMarker {
    pub fn new(index_name: Option<String>) -> Self {
        Self { index_name }
    }
}

impl CitationStrategy for InternalSearchMarker {
    fn name(&self) -> &'static str {
        "internal_search"
    }

    fn extract(&self, payload: &Value) -> Result<Option<Vec<Citation>>, CitationError> {
        let marker = payload.get("azure_ai_search").filter(|v| !v.is_null());
        let typed = payload.get("type").and_then(Value::as_str) == Some("azure_ai_search");
        if marker.is_none() && !typed {
            return Ok(None);
        }
        let index_name = marker
            .and_then(|m| first_string(m, &["index_name", "indexName"]))
            .map(str::to_string)
            .or_else(|| self.index_name.clone());
        Ok(Some(vec![Citation::internal(INTERNAL_TITLE, index_name)]))
    }
}

/// Web grounding metadata. Discrete results are used when present;
/// otherwise fallbacks are synthesized from the search query.
pub struct GroundingMetadata;

impl CitationStrategy for GroundingMetadata {
    fn name(&self) -> &'static str {
        "grounding_metadata"
    }

    fn extract(&self, payload: &Value) -> Result<Option<Vec<Citation>>, CitationError> {
        let Some(raw) = payload.get("bing_grounding").filter(|v| !v.is_null()) else {
            return Ok(None);
        };
        let metadata = match raw {
            Value::String(s) => {
                grounding::parse_lenient(s).ok_or_else(|| CitationError::InvalidPayload {
                    strategy: self.name(),
                    reason: "grounding metadata is neither JSON nor a literal".into(),
                })?
            }
            other => other.clone(),
        };
        Ok(Some(grounding::citations(&metadata)))
    }
}
