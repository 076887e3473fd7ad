//! LaTeX detection in free-form model output.
//!
//! Detection is deliberately narrow: only document-level structure counts
//! (`\documentclass`, `\begin{document}`, `\end{document}`). A response that
//! merely mentions `\textbf` is prose, not a compilable document.

use once_cell::sync::Lazy;
use regex::Regex;

static SIGNALS: Lazy<[Regex; 3]> = Lazy::new(|| {
    [
        Regex::new(r"(?i)\\documentclass").expect("valid regex"),
        Regex::new(r"(?i)\\begin\s*\{\s*document\s*\}").expect("valid regex"),
        Regex::new(r"(?i)\\end\s*\{\s*document\s*\}").expect("valid regex"),
    ]
});

/// A fenced block: three backticks, an optional info string (`latex`, `tex`, ...),
/// then the body up to the next closing fence.
static FENCED_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+\-]*[ \t]*\r?\n?(.*?)```").expect("valid regex")
});

/// True if any structural LaTeX signal appears in `text` (case-insensitive).
pub fn is_latex_content(text: &str) -> bool {
    SIGNALS.iter().any(|re| re.is_match(text))
}

/// Returns the compilable LaTeX embedded in `text`, or `None` if there is none.
///
/// Preference order:
/// 1. the first fenced block whose body carries a structural signal, trimmed;
/// 2. the first fenced block at all, trimmed;
/// 3. the whole input.
pub fn extract_latex_content(text: &str) -> Option<String> {
    if !is_latex_content(text) {
        return None;
    }

    let blocks: Vec<&str> = FENCED_BLOCK
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str().trim()))
        .filter(|body| !body.is_empty())
        .collect();

    let chosen = blocks
        .iter()
        .find(|body| is_latex_content(body))
        .or_else(|| blocks.first())
        .copied()
        .unwrap_or(text);

    Some(chosen.to_string())
}
