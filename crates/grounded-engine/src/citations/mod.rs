//! Citation extraction and rendering.
//!
//! Tool and agent outputs come in several shapes. Each shape is handled by
//! one [`CitationStrategy`]; strategies are tried in order and the first one
//! that recognizes a payload wins. Extraction never fails: unreadable
//! payloads are logged and skipped.

mod grounding;
mod render;
mod strategies;

pub use render::{escape_html, render};
pub use strategies::{
    CitationStrategy, GroundingMetadata, InternalSearchMarker, ResearchReport, ResultsArray,
};

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

/// Most synthesized fallback citations kept per exchange.
pub const MAX_SYNTHESIZED: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CitationKind {
    Web,
    Internal,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    #[serde(rename = "type")]
    pub kind: CitationKind,
    /// `W1`, `W2`.. for web sources, `S1`.. for internal ones. Assigned by
    /// [`CitationNormalizer::extract`].
    pub source_label: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Built from a search query rather than a retrieved result.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub synthesized: bool,
}

impl Citation {
    pub fn web(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: CitationKind::Web,
            source_label: String::new(),
            title: title.into(),
            url: Some(url.into()),
            index_name: None,
            query: None,
            synthesized: false,
        }
    }

    pub fn internal(title: impl Into<String>, index_name: Option<String>) -> Self {
        Self {
            kind: CitationKind::Internal,
            source_label: String::new(),
            title: title.into(),
            url: None,
            index_name,
            query: None,
            synthesized: false,
        }
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn synthesized(mut self) -> Self {
        self.synthesized = true;
        self
    }
}

pub struct CitationNormalizer {
    strategies: Vec<Box<dyn CitationStrategy>>,
}

impl Default for CitationNormalizer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl CitationNormalizer {
    /// Default strategy order. `internal_index` names the document index
    /// reported on internal citations.
    pub fn new(internal_index: Option<String>) -> Self {
        Self::with_strategies(vec![
            Box::new(ResultsArray),
            Box::new(ResearchReport),
            Box::new(InternalSearchMarker::new(internal_index)),
            Box::new(GroundingMetadata),
        ])
    }

    pub fn with_strategies(strategies: Vec<Box<dyn CitationStrategy>>) -> Self {
        Self { strategies }
    }

    /// Extract, de-duplicate and number citations from raw payloads, in
    /// discovery order.
    pub fn extract(&self, raw: &[Value]) -> Vec<Citation> {
        let mut found = Vec::new();
        for payload in raw {
            found.extend(self.extract_one(payload));
        }
        finalize(found)
    }

    /// Like [`extract`](Self::extract) for tool outputs that are JSON text.
    /// Outputs that are not JSON carry no citations.
    pub fn extract_texts<S: AsRef<str>>(&self, outputs: &[S]) -> Vec<Citation> {
        let payloads: Vec<Value> = outputs
            .iter()
            .filter_map(|s| serde_json::from_str(s.as_ref()).ok())
            .collect();
        self.extract(&payloads)
    }

    fn extract_one(&self, payload: &Value) -> Vec<Citation> {
        for candidate in candidates(payload) {
            for strategy in &self.strategies {
                match strategy.extract(&candidate) {
                    Ok(Some(citations)) => {
                        debug!(strategy = strategy.name(), count = citations.len(), "citation strategy matched");
                        return citations;
                    }
                    Ok(None) => {}
                    Err(e) => warn!(strategy = strategy.name(), error = %e, "citation strategy failed"),
                }
            }
        }
        Vec::new()
    }
}

/// A run-step payload may wrap the interesting JSON in `output` or
/// `function.output`, often as a JSON string. Wrapped outputs are tried
/// before the payload itself.
fn candidates(payload: &Value) -> Vec<Value> {
    let mut out = Vec::new();
    if let Value::String(s) = payload {
        if let Ok(parsed) = serde_json::from_str::<Value>(s) {
            if !parsed.is_string() {
                out.extend(candidates(&parsed));
            }
        }
        return out;
    }

    for wrapped in [payload.pointer("/function/output"), payload.get("output")]
        .into_iter()
        .flatten()
    {
        match wrapped {
            Value::String(s) => {
                if let Ok(parsed) = serde_json::from_str::<Value>(s) {
                    out.push(parsed);
                }
            }
            Value::Null => {}
            other => out.push(other.clone()),
        }
    }
    out.push(payload.clone());
    out
}

fn finalize(found: Vec<Citation>) -> Vec<Citation> {
    let has_structured_web = found
        .iter()
        .any(|c| c.kind == CitationKind::Web && !c.synthesized);

    let mut seen_urls = HashSet::new();
    let mut synthesized = 0;
    let mut kept = Vec::with_capacity(found.len());
    for citation in found {
        if citation.synthesized {
            if has_structured_web || synthesized >= MAX_SYNTHESIZED {
                continue;
            }
        }
        if citation.kind == CitationKind::Web {
            if let Some(url) = &citation.url {
                if !seen_urls.insert(url.clone()) {
                    continue;
                }
            }
        }
        if citation.synthesized {
            synthesized += 1;
        }
        kept.push(citation);
    }

    let (mut web, mut internal) = (0, 0);
    for citation in &mut kept {
        citation.source_label = match citation.kind {
            CitationKind::Web => {
                web += 1;
                format!("W{web}")
            }
            CitationKind::Internal => {
                internal += 1;
                format!("S{internal}")
            }
        };
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(citations: &[Citation]) -> Vec<&str> {
        citations.iter().map(|c| c.source_label.as_str()).collect()
    }

    #[test]
    fn empty_input_is_empty_list() {
        let normalizer = CitationNormalizer::default();
        assert!(normalizer.extract(&[]).is_empty());
        assert!(normalizer.extract(&[json!({}), json!(null), json!("plain text")]).is_empty());
        assert!(normalizer.extract_texts(&["not json", ""]).is_empty());
    }

    #[test]
    fn results_array_in_tool_output() {
        let normalizer = CitationNormalizer::default();
        let citations = normalizer.extract_texts(&[
            r#"{"results":[{"name":"JMA","url":"https://www.jma.go.jp/"},{"title":"Tenki","link":"https://tenki.jp/"}]}"#,
        ]);
        assert_eq!(labels(&citations), vec!["W1", "W2"]);
        assert_eq!(citations[0].title, "JMA");
        assert_eq!(citations[1].url.as_deref(), Some("https://tenki.jp/"));
        assert!(citations.iter().all(|c| !c.synthesized));
    }

    #[test]
    fn grounding_query_only_yields_synthesized_fallbacks() {
        let normalizer = CitationNormalizer::default();
        let step = json!({
            "type": "bing_grounding",
            "bing_grounding": {
                "requesturl": "https://api.bing.microsoft.com/v7.0/search?q=rust%20async%20book"
            }
        });
        let citations = normalizer.extract(&[step]);
        assert!(!citations.is_empty() && citations.len() <= MAX_SYNTHESIZED);
        assert!(citations.iter().all(|c| c.synthesized));
        assert_eq!(
            citations[0].url.as_deref(),
            Some("https://www.bing.com/search?q=rust+async+book")
        );
    }

    #[test]
    fn synthesized_dropped_when_structured_exists() {
        let normalizer = CitationNormalizer::default();
        let citations = normalizer.extract(&[
            json!({"bing_grounding": {"requesturl": "https://api.bing.microsoft.com/v7.0/search?q=tokyo"}}),
            json!({"results": [{"url": "https://example.com/a"}]}),
        ]);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].source_label, "W1");
        assert!(!citations[0].synthesized);
    }

    #[test]
    fn synthesized_capped_across_payloads() {
        let normalizer = CitationNormalizer::default();
        let citations = normalizer.extract(&[
            json!({"bing_grounding": {"requesturl": "https://x.test/search?q=alpha"}}),
            json!({"bing_grounding": {"requesturl": "https://x.test/search?q=beta"}}),
        ]);
        assert_eq!(citations.len(), MAX_SYNTHESIZED);
    }

    #[test]
    fn web_deduplicated_and_numbered_separately_from_internal() {
        let normalizer = CitationNormalizer::new(Some("docs-index".into()));
        let citations = normalizer.extract(&[
            json!({"results": [{"url": "https://a.example"}, {"url": "https://b.example"}]}),
            json!({"type": "azure_ai_search", "azure_ai_search": {}}),
            json!({"results": [{"url": "https://a.example", "title": "dup"}]}),
        ]);
        assert_eq!(labels(&citations), vec!["W1", "W2", "S1"]);
        assert_eq!(citations[2].index_name.as_deref(), Some("docs-index"));
        assert_eq!(citations[2].kind, CitationKind::Internal);
    }

    #[test]
    fn function_step_output_is_unwrapped() {
        let normalizer = CitationNormalizer::default();
        let step = json!({
            "id": "call_1",
            "type": "function",
            "function": {
                "name": "search_internal_documents",
                "arguments": "{\"query\":\"leave\"}",
                "output": "{\"results\":[{\"title\":\"Leave rules\",\"url\":\"https://intra.example/leave\"}]}"
            }
        });
        let citations = normalizer.extract(&[step]);
        assert_eq!(citations.len(), 1);
        assert_eq!(citations[0].title, "Leave rules");
    }

    #[test]
    fn serializes_with_type_tag() {
        let mut citation = Citation::web("t", "https://x.example");
        citation.source_label = "W1".into();
        let json = serde_json::to_value(&citation).unwrap();
        assert_eq!(json["type"], "web");
        assert_eq!(json["source_label"], "W1");
        assert!(json.get("synthesized").is_none());
        assert!(json.get("index_name").is_none());
    }
}
