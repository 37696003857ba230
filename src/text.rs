//! Lightweight text normalization shared by the hashing embedder, the
//! contradiction heuristic and short-term matching.

/// Words that flip the polarity of a statement
const NEGATION_WORDS: &[&str] = &[
    "not", "no", "never", "dont", "doesnt", "didnt", "isnt", "arent", "wasnt", "werent", "cant",
    "cannot", "wont", "neither", "nor", "nothing",
];

/// Function words that carry no topical signal
const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "am", "was", "were", "be", "been", "being", "i", "im", "me",
    "my", "mine", "you", "your", "we", "our", "he", "she", "it", "its", "they", "their", "this",
    "that", "these", "those", "to", "of", "in", "on", "at", "for", "and", "or", "but", "with",
    "as", "by", "from", "do", "does", "did", "what", "which", "who", "whom", "how", "when",
    "where", "why", "have", "has", "had", "will", "would", "can", "could", "should", "shall",
    "may", "might", "about", "into", "than", "then", "so", "very", "really", "just", "also",
];

/// Lower-cased alphanumeric words, apostrophes folded ("don't" -> "dont")
pub(crate) fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '\'' || c == '\u{2019}'))
        .map(|w| {
            w.chars()
                .filter(|c| *c != '\'' && *c != '\u{2019}')
                .flat_map(char::to_lowercase)
                .collect::<String>()
        })
        .filter(|w| !w.is_empty())
}

pub(crate) fn is_negation(word: &str) -> bool {
    NEGATION_WORDS.contains(&word)
}

pub(crate) fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(&word)
}

/// Whether the statement is phrased negatively
pub fn has_negation(text: &str) -> bool {
    words(text).any(|w| is_negation(&w))
}

/// Content terms: stop words and negations dropped, naive plural stemming
pub(crate) fn content_terms(text: &str) -> Vec<String> {
    words(text)
        .filter(|w| !is_stop_word(w) && !is_negation(w))
        .map(|mut w| {
            if w.len() > 3 && w.ends_with('s') && !w.ends_with("ss") {
                w.pop();
            }
            w
        })
        .collect()
}

/// Canonical form used to decide whether two texts state the same thing verbatim
pub(crate) fn normalize(text: &str) -> String {
    words(text).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apostrophes_fold_into_negations() {
        assert!(has_negation("User doesn't like tea"));
        assert!(has_negation("User does not like tea"));
        assert!(has_negation("I don\u{2019}t drink coffee"));
        assert!(!has_negation("User likes tea"));
    }

    #[test]
    fn content_terms_drop_function_words() {
        assert_eq!(content_terms("User likes tea"), vec!["user", "like", "tea"]);
        assert_eq!(content_terms("User does not like tea"), vec!["user", "like", "tea"]);
        assert_eq!(content_terms("The glass is clear"), vec!["glass", "clear"]);
    }

    #[test]
    fn normalize_ignores_case_and_punctuation() {
        assert_eq!(normalize("Favourite food is sushi."), normalize("  favourite FOOD is sushi"));
    }
}
