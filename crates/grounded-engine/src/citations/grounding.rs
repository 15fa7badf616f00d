use serde_json::Value;
use tracing::debug;

use super::strategies::first_string;
use super::Citation;

const MAX_DISCRETE: usize = 3;
const WEATHER_KEYWORDS: &[&str] = &["weather", "forecast", "天気", "気温", "予報"];
const QUERY_KEYS: &[&str] = &["query", "q", "search_query", "searchQuery", "input"];

/// Citations for one grounding metadata object.
pub(super) fn citations(metadata: &Value) -> Vec<Citation> {
    let query = search_query(metadata);

    if let Some(results) = metadata
        .get("results")
        .and_then(Value::as_array)
        .filter(|r| !r.is_empty())
    {
        return results
            .iter()
            .take(MAX_DISCRETE)
            .enumerate()
            .map(|(i, result)| discrete(i, result, query.as_deref()))
            .collect();
    }

    match query {
        Some(query) => fallbacks(&query),
        None => {
            debug!("grounding metadata without results or query");
            Vec::new()
        }
    }
}

fn discrete(i: usize, result: &Value, query: Option<&str>) -> Citation {
    let title = first_string(result, &["title", "name", "display_name", "snippet"])
        .map(str::to_string)
        .unwrap_or_else(|| format!("Web result {}", i + 1));
    match first_string(result, &["url", "link", "source_url", "href"]) {
        Some(url) => {
            let citation = Citation::web(title, url);
            match query {
                Some(q) => citation.with_query(q),
                None => citation,
            }
        }
        None => {
            let q = query.unwrap_or(&title).to_string();
            Citation::web(title, search_url("https://www.bing.com/search", "q", &q))
                .with_query(q)
                .synthesized()
        }
    }
}

/// Best-effort sources for a query when the service returned no URLs.
pub(super) fn fallbacks(query: &str) -> Vec<Citation> {
    let lowered = query.to_lowercase();
    let candidates = if WEATHER_KEYWORDS.iter().any(|k| lowered.contains(k)) {
        [
            (
                format!("Yahoo! Weather: {query}"),
                search_url("https://weather.yahoo.co.jp/weather/search/", "p", query),
            ),
            (
                format!("Weathernews: {query}"),
                search_url("https://weathernews.jp/s/search.html", "q", query),
            ),
        ]
    } else {
        [
            (
                format!("Bing search: {query}"),
                search_url("https://www.bing.com/search", "q", query),
            ),
            (
                format!("Google search: {query}"),
                search_url("https://www.google.com/search", "q", query),
            ),
        ]
    };
    candidates
        .into_iter()
        .map(|(title, url)| Citation::web(title, url).with_query(query).synthesized())
        .collect()
}

/// `base` with `query` form-encoded under `param`.
fn search_url(base: &str, param: &str, query: &str) -> String {
    match reqwest::Url::parse_with_params(base, [(param, query.trim())]) {
        Ok(url) => url.into(),
        Err(_) => base.to_string(),
    }
}

/// Query from `requesturl`'s `q` parameter, then from `response_metadata`,
/// then from plain query fields.
fn search_query(metadata: &Value) -> Option<String> {
    if let Some(q) = metadata
        .get("requesturl")
        .and_then(Value::as_str)
        .and_then(query_param)
    {
        return Some(q);
    }

    if let Some(meta) = metadata.get("response_metadata") {
        let parsed = match meta {
            Value::String(s) => parse_lenient(s),
            other => Some(other.clone()),
        };
        if let Some(q) = parsed.as_ref().and_then(|m| first_string(m, QUERY_KEYS)) {
            return Some(q.to_string());
        }
    }

    first_string(metadata, QUERY_KEYS).map(str::to_string)
}

fn query_param(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    parsed
        .query_pairs()
        .find(|(k, _)| k == "q")
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Parse JSON, falling back to a Python-style literal (single quotes,
/// `True`/`False`/`None`).
pub(super) fn parse_lenient(raw: &str) -> Option<Value> {
    serde_json::from_str(raw)
        .or_else(|_| serde_json::from_str(&literal_to_json(raw)))
        .ok()
}

fn literal_to_json(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    let mut quote: Option<char> = None;

    while let Some(c) = chars.next() {
        match quote {
            Some(q) => {
                if c == '\\' {
                    match chars.next() {
                        Some('\'') => out.push('\''),
                        Some(next) => {
                            out.push('\\');
                            out.push(next);
                        }
                        None => out.push('\\'),
                    }
                } else if c == q {
                    out.push('"');
                    quote = None;
                } else if c == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(c);
                }
            }
            None if c == '\'' || c == '"' => {
                out.push('"');
                quote = Some(c);
            }
            None if c.is_ascii_alphabetic() => {
                let mut word = String::from(c);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        word.push(n);
                        chars.next();
                    } else {
                        break;
                    }
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            None => out.push(c),
        }
    }
    out
}
