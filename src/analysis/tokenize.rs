use std::collections::HashSet;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use unicode_normalization::UnicodeNormalization;
use unicode_segmentation::UnicodeSegmentation;

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in", "into", "is",
        "it", "no", "not", "of", "on", "or", "such", "that", "the", "their", "then", "there",
        "these", "they", "this", "to", "was", "will", "with",
    ]
    .into_iter()
    .collect()
});

/// Case-insensitive membership in the English stop list.
#[must_use]
pub fn is_stop_word(word: &str) -> bool {
    STOP_WORDS.contains(word.to_lowercase().as_str())
}

/// One analysed unit of text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub value: String,
    pub stopped: bool,
}

fn default_true() -> bool {
    true
}

/// Word tokenizer backed by UAX#29 word boundaries.
///
/// Case is preserved unless `lowercase` is set, so that case variants of a term
/// stay distinguishable in the vocabulary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StandardAnalyser {
    #[serde(default = "default_true")]
    pub remove_stopwords: bool,
    #[serde(default)]
    pub lowercase: bool,
}

impl Default for StandardAnalyser {
    fn default() -> Self {
        Self {
            remove_stopwords: true,
            lowercase: false,
        }
    }
}

impl StandardAnalyser {
    pub fn analyse<'a>(&'a self, text: &'a str) -> impl Iterator<Item = Token> + 'a {
        text.unicode_words().map(move |word| {
            let mut value: String = word.nfkc().collect();
            if self.lowercase {
                value = value.to_lowercase();
            }
            let stopped = self.remove_stopwords && is_stop_word(&value);
            Token { value, stopped }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_stop_words_without_dropping_them() {
        let analyser = StandardAnalyser::default();
        let tokens: Vec<Token> = analyser.analyse("The cat sat on the mat.").collect();
        let values: Vec<&str> = tokens.iter().map(|t| t.value.as_str()).collect();
        assert_eq!(values, vec!["The", "cat", "sat", "on", "the", "mat"]);
        let stopped: Vec<bool> = tokens.iter().map(|t| t.stopped).collect();
        assert_eq!(stopped, vec![true, false, false, true, true, false]);
    }

    #[test]
    fn lowercase_and_stopword_switches() {
        let analyser = StandardAnalyser {
            remove_stopwords: false,
            lowercase: true,
        };
        let tokens: Vec<Token> = analyser.analyse("The Cat").collect();
        assert_eq!(tokens[0].value, "the");
        assert!(!tokens[0].stopped);
        assert_eq!(tokens[1].value, "cat");
    }

    #[test]
    fn normalises_compatibility_forms() {
        let analyser = StandardAnalyser::default();
        let tokens: Vec<Token> = analyser.analyse("\u{FB01}sh").collect();
        assert_eq!(tokens[0].value, "fish");
    }
}
