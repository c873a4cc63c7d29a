//! Query-term excerpting for search results.

use std::collections::HashSet;

/// Excerpt length in characters.
pub const WINDOW_CHARS: usize = 200;
/// Distance between candidate window starts.
pub const STEP_CHARS: usize = 50;

/// Pick the 200-character window of `content` containing the most distinct query terms.
///
/// Terms are the lower-cased whitespace-separated words of `query`. Ties go to the
/// earliest window. Ellipses mark truncation on either side of a matching window. When
/// no window contains a term, the first 200 characters are returned as they are.
#[must_use]
pub fn highlight(content: &str, query: &str) -> String {
    let chars: Vec<char> = content.chars().collect();
    if chars.is_empty() {
        return String::new();
    }

    let terms: Vec<String> = {
        let mut seen = HashSet::new();
        query
            .split_whitespace()
            .map(str::to_lowercase)
            .filter(|t| seen.insert(t.clone()))
            .collect()
    };

    let mut best: Option<(usize, usize)> = None;
    let mut start = 0;
    loop {
        let end = (start + WINDOW_CHARS).min(chars.len());
        let window: String = chars[start..end].iter().collect::<String>().to_lowercase();
        let hits = terms.iter().filter(|t| window.contains(t.as_str())).count();
        if hits > 0 && best.is_none_or(|(_, best_hits)| hits > best_hits) {
            best = Some((start, hits));
        }
        if end == chars.len() {
            break;
        }
        start += STEP_CHARS;
    }

    let Some((start, _)) = best else {
        return chars.iter().take(WINDOW_CHARS).collect();
    };
    let end = (start + WINDOW_CHARS).min(chars.len());
    let mut excerpt = String::with_capacity(WINDOW_CHARS + 6);
    if start > 0 {
        excerpt.push_str("...");
    }
    excerpt.extend(&chars[start..end]);
    if end < chars.len() {
        excerpt.push_str("...");
    }
    excerpt
}
