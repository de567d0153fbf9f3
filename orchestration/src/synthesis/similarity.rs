//! Text similarity used for consensus clustering and merge de-duplication
//!
//! Jaccard similarity over lowercase alphanumeric word sets. Two empty texts
//! are identical; an empty text is dissimilar to any non-empty one.

use regex::Regex;
use std::collections::BTreeSet;
use std::sync::LazyLock;

static WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[[:alnum:]]+").expect("WORD_RE regex should compile"));

/// Sentence ends at terminal punctuation followed by whitespace, or a newline
static SENTENCE_END_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?]+(?:\s+|$)|\n+").expect("SENTENCE_END_RE regex should compile")
});

/// Lowercase word set of `text`
pub fn word_set(text: &str) -> BTreeSet<String> {
    WORD_RE
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .collect()
}

/// Jaccard index of two word sets
pub fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f32 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f32 / union as f32
}

/// Similarity of two texts in [0, 1]
pub fn similarity(a: &str, b: &str) -> f32 {
    jaccard(&word_set(a), &word_set(b))
}

/// Split text into trimmed sentences, keeping terminal punctuation.
/// Fragments without any word are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut start = 0;
    for m in SENTENCE_END_RE.find_iter(text) {
        push_sentence(&mut sentences, &text[start..m.end()]);
        start = m.end();
    }
    push_sentence(&mut sentences, &text[start..]);
    sentences
}

fn push_sentence(out: &mut Vec<String>, fragment: &str) {
    let fragment = fragment.trim();
    if WORD_RE.is_match(fragment) {
        out.push(fragment.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_texts() {
        assert_eq!(similarity("The answer is 42", "the ANSWER is 42!"), 1.0);
    }

    #[test]
    fn test_partial_overlap() {
        // {paris, is, the, capital} vs {paris, is, capital, of, france}
        let s = similarity("Paris is the capital", "Paris is capital of France");
        assert!((s - 3.0 / 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_empty_inputs() {
        assert_eq!(similarity("", ""), 1.0);
        assert_eq!(similarity("", "something"), 0.0);
        assert_eq!(similarity("...", "!!!"), 1.0);
    }

    #[test]
    fn test_split_sentences() {
        let sentences = split_sentences("First point. Second point!\nThird line\n\n  ");
        assert_eq!(
            sentences,
            vec!["First point.", "Second point!", "Third line"]
        );
    }

    #[test]
    fn test_split_keeps_decimals_together() {
        let sentences = split_sentences("Pi is 3.14 roughly. Done.");
        assert_eq!(sentences, vec!["Pi is 3.14 roughly.", "Done."]);
    }
}
