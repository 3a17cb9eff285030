//! Lexical query normalisation (the N1 rules)
//!
//! Lowercase, split on non-alphanumeric, keep terms of length >= 3, drop
//! stopwords, no stemming. These rules are shared by chunk derivation,
//! SimHash, and retrieval so lexical behaviour is identical on every backend.

use once_cell::sync::Lazy;
use std::collections::HashSet;

/// Minimum term length retained by the normaliser.
pub const MIN_TERM_LEN: usize = 3;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was",
        "one", "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now",
        "old", "see", "two", "way", "who", "did", "its", "let", "put", "say", "she", "too",
        "use", "that", "with", "have", "this", "will", "your", "from", "they", "know", "want",
        "been", "good", "much", "some", "time", "very", "when", "come", "here", "just", "like",
        "long", "make", "many", "more", "only", "over", "such", "take", "than", "them", "well",
        "were", "what", "which", "their", "there", "would", "could", "should", "about", "after",
        "before", "into", "onto", "also", "each", "other", "these", "those", "then", "them",
        "because", "while", "where", "does", "doing", "done", "being", "might", "must", "shall",
        "upon", "again", "between", "both", "down", "further", "itself", "once",
    ]
    .into_iter()
    .collect()
});

/// Whether a term is in the stopword list.
pub fn is_stopword(term: &str) -> bool {
    STOPWORDS.contains(term)
}

/// Normalise text into query terms, preserving order and duplicates.
///
/// Duplicates matter for lexical ranking (term frequency); callers that need
/// the distinct set use [`unique_terms`].
pub fn normalize_terms(text: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_alphanumeric() {
            current.extend(ch.to_lowercase());
        } else if !current.is_empty() {
            push_term(&mut terms, std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        push_term(&mut terms, current);
    }
    terms
}

fn push_term(terms: &mut Vec<String>, term: String) {
    if term.len() >= MIN_TERM_LEN && !is_stopword(&term) {
        terms.push(term);
    }
}

/// Distinct normalised terms, in first-seen order.
pub fn unique_terms(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    normalize_terms(text)
        .into_iter()
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Jaccard similarity of the distinct term sets of two texts.
///
/// Used by the identity consolidator to group `becoming` statements.
pub fn term_jaccard(a: &str, b: &str) -> f32 {
    let sa: HashSet<String> = unique_terms(a).into_iter().collect();
    let sb: HashSet<String> = unique_terms(b).into_iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f32;
    let union = sa.union(&sb).count() as f32;
    intersection / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        let terms = normalize_terms("What is this project for?");
        assert_eq!(terms, vec!["project"]);
    }

    #[test]
    fn test_normalize_splits_on_non_alnum() {
        let terms = normalize_terms("retrieval/scoring: lexical+recency");
        assert_eq!(terms, vec!["retrieval", "scoring", "lexical", "recency"]);
    }

    #[test]
    fn test_normalize_drops_short_terms() {
        let terms = normalize_terms("go to db v2");
        assert!(terms.is_empty());
    }

    #[test]
    fn test_normalize_keeps_duplicates() {
        let terms = normalize_terms("budget budget budget");
        assert_eq!(terms.len(), 3);
    }

    #[test]
    fn test_unique_terms_dedupes() {
        let terms = unique_terms("budget review budget plan");
        assert_eq!(terms, vec!["budget", "review", "plan"]);
    }

    #[test]
    fn test_no_stemming() {
        // "decisions" and "decision" stay distinct terms.
        let terms = unique_terms("decision decisions");
        assert_eq!(terms.len(), 2);
    }

    #[test]
    fn test_jaccard_similarity() {
        let a = "becoming more careful with token budgets";
        let b = "becoming careful about token budgets";
        let c = "learning postgres connection pooling";
        assert!(term_jaccard(a, b) > term_jaccard(a, c));
        assert_eq!(term_jaccard("", ""), 0.0);
        let exact = term_jaccard(a, a);
        assert!((exact - 1.0).abs() < f32::EPSILON);
    }
}
