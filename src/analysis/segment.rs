use once_cell::sync::OnceCell;
use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

/// Split text into paragraphs separated by one or more blank lines.
///
/// Paragraphs are trimmed; empty ones are dropped.
#[must_use]
pub fn split_paragraphs(text: &str) -> Vec<&str> {
    static PARAGRAPH_BREAK: OnceCell<std::result::Result<Regex, String>> = OnceCell::new();
    let pattern = PARAGRAPH_BREAK
        .get_or_init(|| Regex::new(r"\n[^\S\n]*\n\s*").map_err(|err| err.to_string()));
    let parts: Vec<&str> = match pattern {
        Ok(re) => re.split(text).collect(),
        Err(err) => {
            tracing::warn!(%err, "paragraph pattern unavailable, treating text as one paragraph");
            vec![text]
        }
    };
    parts
        .into_iter()
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// Split a paragraph into sentences using UAX#29 sentence boundaries.
#[must_use]
pub fn split_sentences(paragraph: &str) -> Vec<&str> {
    paragraph
        .split_sentence_bounds()
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paragraphs_split_on_blank_lines() {
        let text = "First para\nstill first.\n\n  \nSecond para.\n\n\nThird.";
        assert_eq!(
            split_paragraphs(text),
            vec!["First para\nstill first.", "Second para.", "Third."]
        );
    }

    #[test]
    fn blank_text_has_no_paragraphs() {
        assert!(split_paragraphs("  \n\n \n").is_empty());
    }

    #[test]
    fn sentences_follow_terminal_punctuation() {
        assert_eq!(
            split_sentences("The cat sat. The cat ran."),
            vec!["The cat sat.", "The cat ran."]
        );
    }
}
