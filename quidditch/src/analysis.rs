//! Text analysis contract shared by the indexing and query paths.
//!
//! Analyzed fields are tokenized by the embedded engine's default analyzer:
//! lowercase, split on any non-alphanumeric rune, empty tokens discarded.
//! Query-side `match` and `phrase` inputs must be run through the same
//! function so query terms line up with indexed terms. Keyword fields are
//! never tokenized.

/// Tokenize a string the way analyzed text fields are indexed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

/// Normalize a single term for term-level queries (prefix, wildcard, fuzzy)
/// against analyzed fields. Keyword fields keep the input verbatim.
pub fn normalize_term(term: &str) -> String {
    term.to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(tokenize("Hello World"), vec!["hello", "world"]);
    }

    #[test]
    fn test_tokenize_punctuation() {
        assert_eq!(
            tokenize("quick, brown... fox!"),
            vec!["quick", "brown", "fox"]
        );
    }

    #[test]
    fn test_tokenize_strips_leading_trailing() {
        assert_eq!(tokenize("  (widget)  "), vec!["widget"]);
    }

    #[test]
    fn test_tokenize_splits_inner_punctuation() {
        assert_eq!(tokenize("foo-bar_baz"), vec!["foo", "bar", "baz"]);
    }

    #[test]
    fn test_tokenize_discards_empty() {
        assert!(tokenize("!!! ---").is_empty());
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn test_tokenize_keeps_digits() {
        assert_eq!(tokenize("error 404 page"), vec!["error", "404", "page"]);
    }

    #[test]
    fn test_normalize_term() {
        assert_eq!(normalize_term("WiDgEt"), "widget");
    }
}
