//! Full-text tokenizer shared by every backend's search layer.

use std::collections::HashSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

/// Normalize a phrase into an ordered, deduplicated term sequence: lowercase,
/// strip diacritics, split on word boundaries. Duplicates keep their first
/// occurrence. An empty phrase yields an empty sequence; rejecting that is
/// the caller's job.
pub fn tokenize(phrase: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut terms = Vec::new();
    for word in phrase.unicode_words() {
        let term: String = word.to_lowercase().nfd().filter(|c| !is_combining_mark(*c)).collect();
        if !term.is_empty() && seen.insert(term.clone()) {
            terms.push(term);
        }
    }
    terms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_and_lowercases() {
        assert_eq!(tokenize("Foo-bar BAZ"), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn test_dedupe_preserves_first_occurrence() {
        assert_eq!(tokenize("b a b c a"), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_strips_diacritics() {
        assert_eq!(tokenize("Crème Brûlée"), vec!["creme", "brulee"]);
        assert_eq!(tokenize("über"), vec!["uber"]);
    }

    #[test]
    fn test_empty_and_punctuation_only() {
        assert!(tokenize("").is_empty());
        assert!(tokenize("... --- !!!").is_empty());
    }

    #[test]
    fn test_parentheses_are_not_word_characters() {
        assert_eq!(tokenize("(cat) dog)"), vec!["cat", "dog"]);
    }
}
