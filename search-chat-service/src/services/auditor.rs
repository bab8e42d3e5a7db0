//! Post-generation citation scan. Observational only: it logs and counts,
//! and never touches the response.

use crate::services::markers::strip_markers;
use crate::services::metrics;
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static BRACKET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\[\]\n]*\]").expect("valid regex"));

static CITATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(\d+)\]\(([^)\s]+)\)").expect("valid regex"));

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CitationReport {
    /// Well-formed `[n](url)` citations, in order of appearance.
    pub citations: usize,
    /// `[...]` tokens not immediately followed by `(`.
    pub unterminated: Vec<String>,
    /// Citations whose number breaks first-use 1..n order or reuses a
    /// number for a different URL.
    pub numbering_violations: Vec<String>,
    /// Cited URLs outside the known source set.
    pub unknown_urls: Vec<String>,
}

impl CitationReport {
    pub fn is_clean(&self) -> bool {
        self.unterminated.is_empty()
            && self.numbering_violations.is_empty()
            && self.unknown_urls.is_empty()
    }
}

pub fn audit(transcript: &str, known_urls: &[String]) -> CitationReport {
    let prose = strip_markers(transcript);
    let mut report = CitationReport::default();

    for m in BRACKET_RE.find_iter(&prose) {
        if !prose[m.end()..].starts_with('(') {
            report.unterminated.push(m.as_str().to_string());
        }
    }

    let mut assigned: HashMap<u64, String> = HashMap::new();
    for caps in CITATION_RE.captures_iter(&prose) {
        report.citations += 1;
        let token = caps[0].to_string();
        let url = caps[2].to_string();
        let Ok(n) = caps[1].parse::<u64>() else {
            report.numbering_violations.push(token);
            continue;
        };

        match assigned.get(&n) {
            Some(existing) if existing != &url => report.numbering_violations.push(token),
            Some(_) => {}
            None => {
                if n != assigned.len() as u64 + 1 {
                    report.numbering_violations.push(token);
                }
                assigned.insert(n, url.clone());
            }
        }

        if !known_urls.iter().any(|known| known == &url) && !report.unknown_urls.contains(&url) {
            report.unknown_urls.push(url);
        }
    }

    report
}

/// Audit and log a finished transcript.
pub fn audit_and_log(request_id: &str, transcript: &str, known_urls: &[String]) -> CitationReport {
    let report = audit(transcript, known_urls);

    metrics::record_broken_citations("unterminated", report.unterminated.len());
    metrics::record_broken_citations("numbering", report.numbering_violations.len());
    metrics::record_broken_citations("unknown_url", report.unknown_urls.len());

    if report.is_clean() {
        tracing::debug!(request_id = %request_id, citations = report.citations, "Citations clean");
    } else {
        tracing::warn!(
            request_id = %request_id,
            citations = report.citations,
            unterminated = ?report.unterminated,
            numbering = ?report.numbering_violations,
            unknown_urls = ?report.unknown_urls,
            "Malformed citations in response"
        );
    }

    report
}
