//! System instruction assembly.
//!
//! The instruction carries the style template, the indexed source list,
//! the citation contract and the closing marker-line requirement.

use crate::models::{ConversationStyle, SearchResult};
use crate::services::markers::{SEARCH_IMAGES, SEARCH_URLS};
use chrono::{DateTime, Utc};
use std::fmt::Write;

const CREATIVE_TEMPLATE: &str = "You are an imaginative, engaging assistant. \
Write vivid, original answers while staying grounded in the sources you are given.";

const BALANCED_TEMPLATE: &str = "You are a helpful, knowledgeable assistant. \
Give clear, well-organized answers that balance depth with brevity.";

const PRECISE_TEMPLATE: &str = "You are a precise, factual assistant. \
Answer concisely, prefer exact figures and dates, and avoid speculation.";

pub fn style_template(style: ConversationStyle) -> &'static str {
    match style {
        ConversationStyle::Creative => CREATIVE_TEMPLATE,
        ConversationStyle::Balanced => BALANCED_TEMPLATE,
        ConversationStyle::Precise => PRECISE_TEMPLATE,
    }
}

pub fn temperature_for(style: ConversationStyle) -> f32 {
    match style {
        ConversationStyle::Creative => 1.0,
        ConversationStyle::Balanced => 0.7,
        ConversationStyle::Precise => 0.2,
    }
}

/// Inputs for one system instruction.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub style: ConversationStyle,
    pub results: &'a [SearchResult],
    pub images: &'a [String],
    /// Whether the search tool is declared for this response.
    pub search_tool: bool,
    pub now: DateTime<Utc>,
}

/// `[i] Title\nURL\nContent` blocks separated by blank lines.
pub fn render_results(results: &[SearchResult]) -> String {
    results
        .iter()
        .map(|r| format!("[{}] {}\n{}\n{}", r.rank, r.title, r.url, r.excerpt.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn citation_contract(out: &mut String, results: &[SearchResult]) {
    out.push_str("\n\n## Citation rules\n");
    out.push_str(
        "- Cite sources inline as [n](URL), where URL is the exact absolute URL of the source.\n\
         - Number citations 1, 2, 3 ... in the order you first use each source in this answer. \
         Restart at 1 for every answer. Reuse a number when citing the same source again.\n\
         - Never write a bare [n] without the (URL) directly after it.\n\
         - Do not add a references, sources or bibliography section at the end.\n\
         - Only cite URLs from the allowed list below or from tool results you receive.\n",
    );

    out.push_str("\nAllowed citation URLs:\n");
    if results.is_empty() {
        out.push_str("(none yet)\n");
    }
    for r in results {
        let _ = writeln!(out, "{}", r.url);
    }
}

/// Build the system instruction for one response.
pub fn build_system_instruction(ctx: &PromptContext<'_>) -> String {
    let mut out = String::new();
    out.push_str(style_template(ctx.style));
    let _ = write!(out, "\nCurrent date: {}.", ctx.now.format("%Y-%m-%d"));

    if ctx.results.is_empty() {
        out.push_str("\n\nNo web sources were retrieved for this question.");
        if ctx.search_tool {
            out.push_str(" Use the search tool if the answer needs current information.");
        }
    } else {
        out.push_str("\n\n## Sources\n");
        out.push_str(&render_results(ctx.results));
    }

    citation_contract(&mut out, ctx.results);

    out.push_str(
        "\n## Formatting\n\
         - Never use the $ sign for currency. Write amounts as \"USD 20\" or \"20 dollars\"; \
         $ is reserved for math.\n",
    );

    let _ = write!(
        out,
        "\n## Closing lines\n\
         End your answer with exactly these two hidden lines, in this order, and nothing after them:\n\
         <!-- {}: url1|url2|... -->\n\
         <!-- {}: image1|image2|... -->\n\
         List every allowed URL above in the given order and these image URLs: {}\n",
        SEARCH_URLS,
        SEARCH_IMAGES,
        if ctx.images.is_empty() {
            "(none)".to_string()
        } else {
            ctx.images.join("|")
        }
    );

    out
}
