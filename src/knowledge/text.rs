//! Word-level helpers shared by clustering and query analysis.

use std::collections::HashSet;

use once_cell::sync::Lazy;

static STOPWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "above", "after", "again", "all", "also", "am", "an", "and", "any", "are",
        "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
        "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "few", "for",
        "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers", "him",
        "his", "how", "i", "if", "in", "into", "is", "it", "its", "itself", "just", "me", "more",
        "most", "my", "no", "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other",
        "our", "ours", "out", "over", "own", "same", "she", "should", "so", "some", "such",
        "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
        "those", "through", "to", "too", "under", "until", "up", "very", "was", "we", "were",
        "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with", "would",
        "you", "your", "yours", "happened", "happen", "tell", "show", "give", "make", "slide",
        "slides", "please", "want", "need", "like", "create", "presentation",
    ]
    .into_iter()
    .collect()
});

pub fn is_stopword(word: &str) -> bool {
    STOPWORDS.contains(word)
}

/// Lowercased alphanumeric words.
pub fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| w.to_lowercase())
}

/// Lowercased words minus stopwords and single characters.
pub fn content_words(text: &str) -> Vec<String> {
    words(text)
        .filter(|w| w.chars().count() >= 2 && !is_stopword(w))
        .collect()
}

/// Whole-word (or whole-phrase) match of `needle` in `haystack`, case-insensitive.
pub fn contains_phrase(haystack: &str, needle: &str) -> bool {
    let hay: Vec<String> = words(haystack).collect();
    let needle: Vec<String> = words(needle).collect();
    if needle.is_empty() || needle.len() > hay.len() {
        return false;
    }
    hay.windows(needle.len()).any(|w| w == needle.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_words_drop_stopwords() {
        assert_eq!(
            content_words("What happened to Acme's revenue in Q3?"),
            vec!["acme", "revenue", "q3"]
        );
    }

    #[test]
    fn contains_phrase_matches_whole_words() {
        assert!(contains_phrase("Acme Corp revenue grew", "acme corp"));
        assert!(contains_phrase("Revenue of ACME", "acme"));
        assert!(!contains_phrase("Acmeville news", "acme"));
        assert!(!contains_phrase("anything", ""));
    }
}
