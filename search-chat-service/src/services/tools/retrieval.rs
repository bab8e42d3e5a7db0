//! Page retrieval for link previews and the retrieval tool.

use super::ToolError;
use crate::models::is_absolute_http_url;
use crate::services::markers::RetrievalCard;
use futures::StreamExt;
use regex::Regex;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use std::sync::LazyLock;
use std::time::Duration;

const SUMMARY_CHARS: usize = 300;
/// Bytes read from a page before the rest of the body is ignored.
pub const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

static URL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"https?://[^\s<>"'`]+"#).expect("valid regex"));

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalArgs {
    pub url: String,
}

/// A fetched page: preview metadata plus readable text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub card: RetrievalCard,
    pub text: String,
}

/// First absolute http(s) URL in a user message, without trailing punctuation.
pub fn first_url(message: &str) -> Option<String> {
    URL_RE
        .find_iter(message)
        .map(|m| {
            m.as_str()
                .trim_end_matches(['.', ',', ';', ':', '!', '?', ')', ']', '}'])
                .to_string()
        })
        .find(|candidate| is_absolute_http_url(candidate))
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => text[..cut].trim_end().to_string(),
        None => text.to_string(),
    }
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_attr(doc: &Html, selector: &str, attr: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .filter_map(|el| el.value().attr(attr))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn first_text(doc: &Html, selector: &str) -> Option<String> {
    let sel = Selector::parse(selector).ok()?;
    doc.select(&sel)
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .find(|t| !t.is_empty())
}

fn readable_text(doc: &Html) -> String {
    let Ok(sel) = Selector::parse("h1, h2, h3, p, li, pre, blockquote, td") else {
        return String::new();
    };
    doc.select(&sel)
        .filter(|el| !inside_chrome(el))
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Navigation, headers and footers are not content.
fn inside_chrome(el: &ElementRef) -> bool {
    el.ancestors()
        .filter_map(ElementRef::wrap)
        .any(|a| matches!(a.value().name(), "nav" | "header" | "footer" | "script" | "style"))
}

fn resolve(base: &Url, href: &str) -> Option<String> {
    base.join(href)
        .ok()
        .map(|u| u.to_string())
        .filter(|u| is_absolute_http_url(u))
}

/// Extract card metadata and readable text from an HTML document.
pub fn extract_page(url: &str, html: &str, max_chars: usize) -> FetchedPage {
    let doc = Html::parse_document(html);
    let base = Url::parse(url).ok();

    let title = first_attr(&doc, r#"meta[property="og:title"]"#, "content")
        .or_else(|| first_text(&doc, "title"))
        .or_else(|| first_text(&doc, "h1"))
        .unwrap_or_else(|| url.to_string());

    let text = truncate_chars(&readable_text(&doc), max_chars);

    let summary = first_attr(&doc, r#"meta[name="description"]"#, "content")
        .or_else(|| first_attr(&doc, r#"meta[property="og:description"]"#, "content"))
        .unwrap_or_else(|| truncate_chars(&collapse_whitespace(&text), SUMMARY_CHARS));

    let image = first_attr(&doc, r#"meta[property="og:image"]"#, "content")
        .and_then(|href| base.as_ref().and_then(|b| resolve(b, &href)))
        .unwrap_or_default();

    let favicon = first_attr(&doc, r#"link[rel~="icon"]"#, "href")
        .or_else(|| first_attr(&doc, r#"link[rel="shortcut icon"]"#, "href"))
        .or_else(|| Some("/favicon.ico".to_string()))
        .and_then(|href| base.as_ref().and_then(|b| resolve(b, &href)))
        .unwrap_or_default();

    FetchedPage {
        card: RetrievalCard {
            url: url.to_string(),
            title: collapse_whitespace(&title),
            favicon,
            image,
            summary,
        },
        text,
    }
}

/// Only markup and plain text are worth reading.
fn is_readable(content_type: &str) -> bool {
    let ct = content_type.to_ascii_lowercase();
    ct.contains("html") || ct.starts_with("text/") || ct.contains("xml")
}

pub struct PageFetcher {
    client: reqwest::Client,
    max_chars: usize,
    max_body_bytes: usize,
    timeout: Duration,
}

impl PageFetcher {
    pub fn new(client: reqwest::Client, max_chars: usize, timeout: Duration) -> Self {
        Self {
            client,
            max_chars,
            max_body_bytes: MAX_BODY_BYTES,
            timeout,
        }
    }

    pub fn with_body_limit(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    /// Read at most `max_body_bytes` of the body.
    async fn read_capped(&self, response: reqwest::Response) -> Result<String, ToolError> {
        let mut bytes = Vec::new();
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ToolError::Upstream(e.to_string()))?;
            let room = self.max_body_bytes.saturating_sub(bytes.len());
            if chunk.len() >= room {
                bytes.extend_from_slice(&chunk[..room]);
                tracing::debug!(limit = self.max_body_bytes, "Page body truncated");
                break;
            }
            bytes.extend_from_slice(&chunk);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, ToolError> {
        let url = url.trim();
        if !is_absolute_http_url(url) {
            return Err(ToolError::InvalidArguments(format!("not an absolute http(s) URL: {}", url)));
        }

        let response = self
            .client
            .get(url)
            .timeout(self.timeout)
            .header(reqwest::header::ACCEPT, "text/html,application/xhtml+xml,text/plain;q=0.8")
            .send()
            .await
            .map_err(|e| ToolError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ToolError::Upstream(format!("{} returned HTTP {}", url, status)));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        if let Some(ct) = content_type.as_deref().filter(|ct| !is_readable(ct)) {
            return Err(ToolError::Upstream(format!("unsupported content type {} at {}", ct, url)));
        }
        let is_html = content_type.as_deref().is_none_or(|ct| ct.contains("html"));
        let final_url = response.url().to_string();
        let body = self.read_capped(response).await?;

        if is_html {
            Ok(extract_page(&final_url, &body, self.max_chars))
        } else {
            let text = truncate_chars(body.trim(), self.max_chars);
            Ok(FetchedPage {
                card: RetrievalCard {
                    url: final_url.clone(),
                    title: final_url,
                    summary: truncate_chars(&collapse_whitespace(&text), SUMMARY_CHARS),
                    ..Default::default()
                },
                text,
            })
        }
    }
}
