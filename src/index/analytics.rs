//! Vocabulary statistics computed in memory from reader results.

use crate::types::TermFrequencies;

/// Suggest merges between lower-case terms and their title-case forms.
///
/// Each pair is `(from, into)`: the rarer spelling folds into the more common
/// one when its frequency ratio is strictly below `merge_threshold`.
#[must_use]
pub fn case_fold_pairs(frequencies: &TermFrequencies, merge_threshold: f64) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for (word, &frequency) in frequencies {
        if !is_lower(word) {
            continue;
        }
        let title = title_case(word);
        let Some(&title_frequency) = frequencies.get(&title) else {
            continue;
        };
        let (lower, upper) = (frequency as f64, title_frequency as f64);
        if lower / upper < merge_threshold {
            pairs.push((word.clone(), title));
        } else if upper / lower < merge_threshold {
            pairs.push((title, word.clone()));
        }
    }
    pairs
}

/// Normalised pointwise mutual information of a bigram, in `[-1, 1]`.
#[must_use]
pub fn npmi(bigram_frames: u64, left_frames: u64, right_frames: u64, corpus_frames: u64) -> f64 {
    let (b, l, r, n) = (
        bigram_frames as f64,
        left_frames as f64,
        right_frames as f64,
        corpus_frames as f64,
    );
    let denominator = -(b / n).ln();
    if denominator == 0.0 {
        // the pair occurs in every frame
        return 1.0;
    }
    (b * n / (l * r)).ln() / denominator
}

/// At least one cased character, and none of them upper-case.
fn is_lower(word: &str) -> bool {
    word.chars().any(char::is_lowercase) && !word.chars().any(char::is_uppercase)
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn folds_rare_spelling_into_common_one() {
        let frequencies = TermFrequencies::from([
            ("apple".to_owned(), 10),
            ("Apple".to_owned(), 2),
            ("bank".to_owned(), 1),
            ("Bank".to_owned(), 9),
            ("cat".to_owned(), 5),
            ("Cat".to_owned(), 5),
        ]);
        let pairs = case_fold_pairs(&frequencies, 0.7);
        assert_eq!(
            pairs,
            vec![
                ("Apple".to_owned(), "apple".to_owned()),
                ("bank".to_owned(), "Bank".to_owned()),
            ]
        );
    }

    #[test]
    fn exact_threshold_does_not_merge() {
        let frequencies = TermFrequencies::from([("dog".to_owned(), 7), ("Dog".to_owned(), 10)]);
        assert!(case_fold_pairs(&frequencies, 0.7).is_empty());
    }

    #[test]
    fn uncased_words_never_fold_into_themselves() {
        let frequencies = TermFrequencies::from([
            ("猫".to_owned(), 3),
            ("東京".to_owned(), 2),
            ("2001".to_owned(), 4),
        ]);
        assert!(case_fold_pairs(&frequencies, 1.5).is_empty());
    }

    #[test]
    fn npmi_bounds() {
        assert!((npmi(5, 5, 5, 100) - 1.0).abs() < 1e-9);
        assert!((npmi(10, 10, 10, 10) - 1.0).abs() < 1e-9);
        let independent = npmi(1, 10, 10, 100);
        assert!(independent.abs() < 1e-9);
    }
}
