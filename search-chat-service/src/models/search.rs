//! Search query, normalized results and the response image list.

use serde::{Deserialize, Serialize};

/// Upper bound on images attached to one response.
pub const MAX_IMAGES: usize = 15;

/// Upper bound on derived sub-queries.
pub const MAX_SUB_QUERIES: usize = 5;

/// A query built once from the last user message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub raw: String,
    /// Ordered, 1..=5 entries. Always contains at least the raw query.
    pub sub_queries: Vec<String>,
}

impl SearchQuery {
    pub fn single(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        Self {
            sub_queries: vec![raw.clone()],
            raw,
        }
    }

    /// Build from expanded sub-queries, trimming, deduplicating and capping
    /// them. Falls back to the raw query when nothing usable remains.
    pub fn expanded<I, S>(raw: impl Into<String>, sub_queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let raw = raw.into();
        let mut out: Vec<String> = Vec::new();
        for q in sub_queries {
            let q = q.as_ref().trim();
            if q.is_empty() || out.iter().any(|existing| existing == q) {
                continue;
            }
            out.push(q.to_string());
            if out.len() == MAX_SUB_QUERIES {
                break;
            }
        }

        if out.is_empty() {
            return Self::single(raw);
        }

        Self {
            raw,
            sub_queries: out,
        }
    }
}

/// One normalized search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    /// 1-based position in the response's known result list.
    pub rank: usize,
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

/// `true` for absolute `http://` or `https://` URLs with a host.
pub fn is_absolute_http_url(candidate: &str) -> bool {
    if !(candidate.starts_with("http://") || candidate.starts_with("https://")) {
        return false;
    }
    match reqwest::Url::parse(candidate) {
        Ok(url) => url.host_str().is_some_and(|h| !h.is_empty()),
        Err(_) => false,
    }
}

/// Ordered, deduplicated list of at most [`MAX_IMAGES`] absolute image URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageList(Vec<String>);

impl ImageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one URL. Returns `false` when it was rejected (invalid,
    /// duplicate or over capacity).
    pub fn push(&mut self, url: &str) -> bool {
        let url = url.trim();
        if self.0.len() >= MAX_IMAGES || !is_absolute_http_url(url) {
            return false;
        }
        if self.0.iter().any(|existing| existing == url) {
            return false;
        }
        self.0.push(url.to_string());
        true
    }

    pub fn extend<I, S>(&mut self, urls: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for url in urls {
            if self.0.len() >= MAX_IMAGES {
                break;
            }
            self.push(url.as_ref());
        }
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl<S: AsRef<str>> FromIterator<S> for ImageList {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut list = ImageList::new();
        list.extend(iter);
        list
    }
}
