use std::fmt::Write;

use super::{Citation, CitationKind};

/// Escape text for use in HTML element content and quoted attributes.
pub fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            _ => out.push(c),
        }
    }
    out
}

/// Render numbered citations as an HTML list. Empty input renders as an
/// empty string. Output depends only on the citations, so rendering the same
/// list twice is byte-identical.
pub fn render(citations: &[Citation]) -> String {
    if citations.is_empty() {
        return String::new();
    }

    let mut html = String::from("<div class='citations'><h4>Sources:</h4><ul>");
    for citation in citations {
        let label = escape_html(&citation.source_label);
        let title = escape_html(&citation.title);
        match citation.kind {
            CitationKind::Web => {
                let class = if citation.synthesized {
                    "web-citation synthesized"
                } else {
                    "web-citation"
                };
                match citation.url.as_deref().filter(|u| is_http_url(u)) {
                    Some(url) => {
                        let url = escape_html(url);
                        let _ = write!(
                            html,
                            "<li class='{class}'>[{label}] <a href='{url}' target='_blank' rel='noopener noreferrer' class='web-link'>{title}</a><span class='source-type'>Web</span></li>"
                        );
                    }
                    None => {
                        let _ = write!(
                            html,
                            "<li class='{class}'>[{label}] {title}<span class='source-type'>Web</span></li>"
                        );
                    }
                }
            }
            CitationKind::Internal => {
                let _ = write!(
                    html,
                    "<li class='internal-citation'>[{label}] {title}<span class='source-type'>Internal documents</span></li>"
                );
            }
        }
    }
    html.push_str("</ul></div>");
    html
}

/// Only `http` and `https` targets become links.
fn is_http_url(url: &str) -> bool {
    let lowered = url.trim_start().to_ascii_lowercase();
    lowered.starts_with("http://") || lowered.starts_with("https://")
}
