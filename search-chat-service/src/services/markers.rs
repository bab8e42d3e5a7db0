//! Out-of-band markers embedded in the streamed text.
//!
//! Wire format, one marker per line:
//!
//! ```text
//! <!-- RETRIEVAL_CARD: {"url":"..","title":"..","favicon":"..","image":"..","summary":".."} -->
//! ...prose...
//!
//! <!-- SEARCH_URLS: https://a|https://b -->
//! <!-- SEARCH_IMAGES: https://x|https://y -->
//! ```
//!
//! The card is the first line. The URL and image lists are the final two
//! lines, in that order. All three are always present, lists may be empty.
//! A literal `|` inside a URL is written as `%7C`.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

pub const SEARCH_URLS: &str = "SEARCH_URLS";
pub const SEARCH_IMAGES: &str = "SEARCH_IMAGES";
pub const RETRIEVAL_CARD: &str = "RETRIEVAL_CARD";

const MARKER_NAMES: [&str; 3] = [SEARCH_URLS, SEARCH_IMAGES, RETRIEVAL_CARD];
const OPEN: &str = "<!--";
const CLOSE: &str = "-->";

static MARKER_SPAN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)[ \t]*<!--\s*(?:SEARCH_URLS|SEARCH_IMAGES|RETRIEVAL_CARD):[^\n]*?(?:-->|$)[ \t]*(?:\r?\n)?")
        .expect("valid regex")
});

static LINE_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)[ \t]*<!--\s*(?:SEARCH_URLS|SEARCH_IMAGES|RETRIEVAL_CARD):.*?(?:-->|$)")
        .expect("valid regex")
});

static EXTRA_BLANK_LINES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Link-preview metadata for a page the user referenced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalCard {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub favicon: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub summary: String,
}

impl RetrievalCard {
    pub fn is_empty(&self) -> bool {
        self.url.is_empty()
    }
}

fn encode_item(url: &str) -> String {
    url.trim().replace('|', "%7C").replace(CLOSE, "--%3E")
}

fn decode_item(item: &str) -> String {
    item.replace("%7C", "|").replace("--%3E", CLOSE)
}

/// `<!-- NAME: a|b -->`. An empty list still produces the marker.
pub fn encode_list(name: &str, urls: &[String]) -> String {
    let joined = urls
        .iter()
        .map(|u| encode_item(u))
        .filter(|u| !u.is_empty())
        .collect::<Vec<_>>()
        .join("|");
    format!("{} {}: {} {}", OPEN, name, joined, CLOSE)
}

pub fn encode_card(card: &RetrievalCard) -> String {
    // serde_json cannot fail on a struct of strings
    let json = serde_json::to_string(card).unwrap_or_else(|_| "{}".to_string());
    format!(
        "{} {}: {} {}",
        OPEN,
        RETRIEVAL_CARD,
        json.replace(CLOSE, "--\\u003e"),
        CLOSE
    )
}

/// First line of every response.
pub fn prefix_line(card: &RetrievalCard) -> String {
    format!("{}\n", encode_card(card))
}

/// Final two lines of every response, separated from the prose by a blank line.
pub fn suffix_lines(urls: &[String], images: &[String]) -> String {
    format!(
        "\n\n{}\n{}",
        encode_list(SEARCH_URLS, urls),
        encode_list(SEARCH_IMAGES, images)
    )
}

/// Body of the first marker called `name`, without delimiters.
fn marker_body<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let mut search_from = 0;
    while let Some(found) = text[search_from..].find(OPEN) {
        let start = search_from + found + OPEN.len();
        let rest = text[start..].trim_start();
        if let Some(body) = rest.strip_prefix(name).and_then(|r| r.strip_prefix(':')) {
            let end = body.find(CLOSE).unwrap_or(body.len());
            return Some(body[..end].trim());
        }
        search_from = start;
    }
    None
}

pub fn decode_list(text: &str, name: &str) -> Option<Vec<String>> {
    marker_body(text, name).map(|body| {
        body.split('|')
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(decode_item)
            .collect()
    })
}

pub fn decode_card(text: &str) -> Option<RetrievalCard> {
    marker_body(text, RETRIEVAL_CARD).and_then(|body| serde_json::from_str(body).ok())
}

/// Remove every marker span and the line break that follows it.
pub fn strip_markers(text: &str) -> String {
    let stripped = MARKER_SPAN_RE.replace_all(text, "");
    EXTRA_BLANK_LINES_RE
        .replace_all(&stripped, "\n\n")
        .trim()
        .to_string()
}

/// Everything a client extracts from a finished transcript.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedTranscript {
    pub card: Option<RetrievalCard>,
    pub urls: Option<Vec<String>>,
    pub images: Option<Vec<String>>,
    pub prose: String,
}

pub fn decode_transcript(text: &str) -> DecodedTranscript {
    DecodedTranscript {
        card: decode_card(text),
        urls: decode_list(text, SEARCH_URLS),
        images: decode_list(text, SEARCH_IMAGES),
        prose: strip_markers(text),
    }
}

/// Whether unfinished text might still turn into a marker.
fn could_be_marker(partial: &str) -> bool {
    let t = partial.trim_start();
    if t.len() < OPEN.len() {
        return OPEN.starts_with(t);
    }
    let Some(rest) = t.strip_prefix(OPEN) else {
        return false;
    };
    let rest = rest.trim_start();
    MARKER_NAMES.iter().any(|name| {
        let tagged = format!("{}:", name);
        tagged.starts_with(rest) || rest.starts_with(&tagged)
    })
}

/// First position from which `text` may still become a marker span,
/// including the blanks right before it.
fn hold_point(text: &str) -> Option<usize> {
    text.match_indices('<')
        .map(|(at, _)| at)
        .find(|&at| could_be_marker(&text[at..]))
        .map(|at| text[..at].trim_end_matches([' ', '\t']).len())
}

/// Line-buffered filter that withholds markers produced by the engine.
///
/// Text streams through until a `<` that could open a marker. From there the
/// rest of the line is held until its line break, then every marker span in
/// it is removed. A line that held only markers is dropped with its break.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    pending: String,
    /// Part of the current line has already been released.
    line_open: bool,
    withheld: usize,
}

impl MarkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> String {
        let mut out = String::new();
        for piece in chunk.split_inclusive('\n') {
            self.pending.push_str(piece);
            if piece.ends_with('\n') {
                let line = std::mem::take(&mut self.pending);
                out.push_str(&self.settle(&line));
                self.line_open = false;
                continue;
            }

            let release = hold_point(&self.pending).unwrap_or(self.pending.len());
            if release > 0 {
                out.extend(self.pending.drain(..release));
                self.line_open = true;
            }
        }
        out
    }

    fn settle(&mut self, held: &str) -> String {
        let spans = LINE_MARKER_RE.find_iter(held).count();
        if spans == 0 {
            return held.to_string();
        }
        self.withheld += spans;
        let rest = LINE_MARKER_RE.replace_all(held, "");
        if !self.line_open && rest.trim().is_empty() {
            String::new()
        } else {
            rest.into_owned()
        }
    }

    /// Flush whatever is still buffered at end of stream.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        let out = self.settle(&rest);
        self.line_open = false;
        out
    }

    /// Marker spans dropped so far.
    pub fn withheld(&self) -> usize {
        self.withheld
    }
}
