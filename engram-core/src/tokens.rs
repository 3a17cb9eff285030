//! Token estimation and budget-aware truncation
//!
//! The estimate is word-structured: one token per whitespace-separated word,
//! plus one more for each further seven characters of an overlong word (real
//! tokenizers split those into subwords). Only text with no words estimates
//! to 0. The estimate is exactly additive across whitespace joins, which the
//! chunk splitter relies on. Chunk estimates are computed once at derivation
//! and stored, so packing never re-tokenises.

/// Characters of a word covered by each additional subword token.
const SUBWORD_CHARS: usize = 7;

fn word_tokens(word: &str) -> i32 {
    let chars = word.chars().count();
    (1 + chars.saturating_sub(1) / SUBWORD_CHARS) as i32
}

/// Estimate token count for text.
///
/// Returns 0 only for text containing no words (empty or all whitespace).
pub fn estimate_tokens(text: &str) -> i32 {
    text.split_whitespace().map(word_tokens).sum()
}

/// Byte spans of whitespace-separated words: `(end_byte_exclusive, word)`.
fn word_spans(text: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut start: Option<usize> = None;
    for (i, ch) in text.char_indices() {
        if ch.is_whitespace() {
            if let Some(s) = start.take() {
                spans.push((i, &text[s..i]));
            }
        } else if start.is_none() {
            start = Some(i);
        }
    }
    if let Some(s) = start {
        spans.push((text.len(), &text[s..]));
    }
    spans
}

/// Truncate text to fit within a token budget.
///
/// Whole words are kept until the budget runs out; the cut then moves back
/// to the last sentence end when that retains at least two thirds of what
/// fit. A single word larger than the whole budget is cut on the subword
/// grid so the result still estimates within budget.
pub fn truncate_to_token_budget(text: &str, budget: i32) -> String {
    if budget <= 0 {
        return String::new();
    }
    if estimate_tokens(text) <= budget {
        return text.to_string();
    }

    let mut used = 0i32;
    let mut keep_end = 0usize;
    let mut sentence_end: Option<usize> = None;
    for (end, word) in word_spans(text) {
        let cost = word_tokens(word);
        if used + cost > budget {
            break;
        }
        used += cost;
        keep_end = end;
        if word.ends_with(['.', '!', '?']) {
            sentence_end = Some(end);
        }
    }

    if keep_end == 0 {
        // The first word alone busts the budget.
        return subword_cut(text.trim_start(), budget);
    }
    if let Some(end) = sentence_end {
        if end * 3 >= keep_end * 2 {
            return text[..end].to_string();
        }
    }
    text[..keep_end].to_string()
}

/// Cut an overlong word so its estimate is exactly `budget`: `budget`
/// subword tokens cover `7 * budget - 6` characters.
fn subword_cut(word: &str, budget: i32) -> String {
    let max_chars = budget as usize * SUBWORD_CHARS - (SUBWORD_CHARS - 1);
    word.chars().take(max_chars).collect()
}

/// Split text into pieces whose token estimates stay within
/// `[min_tokens, max_tokens]`, preferring paragraph then line boundaries.
///
/// The last piece may fall below `min_tokens` when the remainder is short;
/// a single piece is returned unsplit when the whole text fits `max_tokens`.
pub fn split_to_token_windows(text: &str, min_tokens: i32, max_tokens: i32) -> Vec<String> {
    debug_assert!(min_tokens > 0 && max_tokens >= min_tokens);
    if estimate_tokens(text) <= max_tokens {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        return vec![trimmed.to_string()];
    }

    let mut pieces = Vec::new();
    let mut current = String::new();

    for unit in boundary_units(text) {
        // Word-structured estimates are additive across whitespace joins.
        let candidate_est = estimate_tokens(&current) + estimate_tokens(unit);
        if !current.is_empty() && candidate_est > max_tokens {
            flush_window(&mut pieces, &mut current, max_tokens);
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(unit);
        // A single unit can exceed the cap on its own; hard-wrap it.
        while estimate_tokens(&current) > max_tokens {
            let head = truncate_to_token_budget(&current, max_tokens);
            let rest = current[head.len()..].trim_start().to_string();
            pieces.push(head.trim().to_string());
            current = rest;
        }
    }
    if !current.trim().is_empty() {
        pieces.push(current.trim().to_string());
    }

    // Merge a trailing fragment below the minimum into its predecessor when
    // the merge still respects the cap.
    if pieces.len() >= 2 {
        let last_est = estimate_tokens(pieces.last().expect("non-empty"));
        if last_est < min_tokens {
            let last = pieces.pop().expect("non-empty");
            let prev = pieces.last_mut().expect("non-empty");
            if estimate_tokens(prev) + last_est <= max_tokens {
                prev.push('\n');
                prev.push_str(&last);
            } else {
                pieces.push(last);
            }
        }
    }

    pieces.retain(|p| !p.is_empty());
    pieces
}

/// Paragraphs when the text has blank lines, otherwise individual lines.
fn boundary_units(text: &str) -> Vec<&str> {
    let paragraphs: Vec<&str> = text
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    if paragraphs.len() > 1 {
        return paragraphs;
    }
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect()
}

fn flush_window(pieces: &mut Vec<String>, current: &mut String, max_tokens: i32) {
    debug_assert!(estimate_tokens(current) <= max_tokens);
    pieces.push(std::mem::take(current).trim().to_string());
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        /// Truncation never exceeds the budget.
        #[test]
        fn prop_truncation_respects_budget(text in ".{0,1000}", budget in 1i32..500) {
            let truncated = truncate_to_token_budget(&text, budget);
            prop_assert!(estimate_tokens(&truncated) <= budget);
        }

        /// Truncation returns a prefix of the input (modulo leading space).
        #[test]
        fn prop_truncation_is_prefix(text in "[a-z .!?]{0,500}", budget in 1i32..100) {
            let truncated = truncate_to_token_budget(&text, budget);
            prop_assert!(text.trim_start().starts_with(truncated.trim_start()));
        }

        /// Every split window respects the cap and is non-empty.
        #[test]
        fn prop_split_windows_within_cap(text in "[a-z \\n]{0,4000}") {
            for piece in split_to_token_windows(&text, 80, 800) {
                prop_assert!(estimate_tokens(&piece) <= 800);
                prop_assert!(!piece.is_empty());
            }
        }
    }
}
