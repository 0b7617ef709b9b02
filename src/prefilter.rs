//! Title-only screening applied before a claim is attempted

use crate::request::RejectReason;
use once_cell::sync::Lazy;
use regex::Regex;

/// Titles shorter than this are almost never full research articles
pub const MIN_TITLE_WORDS: usize = 5;

static BOOK_WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(?:e-?book|book)\b").expect("book pattern is valid"));

/// Result of screening a title
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrefilterVerdict {
    Accept,
    Reject(RejectReason),
}

impl PrefilterVerdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, PrefilterVerdict::Accept)
    }
}

pub fn word_count(title: &str) -> usize {
    title.split_whitespace().count()
}

pub fn mentions_book(text: &str) -> bool {
    BOOK_WORD.is_match(text)
}

/// Screen a request title: short titles and books are rejected
pub fn evaluate(title: &str) -> PrefilterVerdict {
    if word_count(title) < MIN_TITLE_WORDS {
        return PrefilterVerdict::Reject(RejectReason::ShortTitlePre);
    }
    if mentions_book(title) {
        return PrefilterVerdict::Reject(RejectReason::BookInTitlePre);
    }
    PrefilterVerdict::Accept
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_single_word_is_short() {
        assert_eq!(
            evaluate("AI"),
            PrefilterVerdict::Reject(RejectReason::ShortTitlePre)
        );
    }

    #[test]
    fn test_book_word_rejected() {
        assert_eq!(
            evaluate("A Field Guide to the Book of Proteins"),
            PrefilterVerdict::Reject(RejectReason::BookInTitlePre)
        );
    }

    #[test]
    fn test_research_title_accepted() {
        assert!(evaluate("A Study of Transcription Factor Binding in Yeast").is_accept());
    }

    #[test]
    fn test_notebook_is_not_a_book() {
        // Three words, so the length rule fires first
        assert_eq!(
            evaluate("The Notebook Experiments"),
            PrefilterVerdict::Reject(RejectReason::ShortTitlePre)
        );
        assert!(!mentions_book("The Notebook Experiments"));
        assert!(evaluate("Lab Notebook Practices in Modern Molecular Biology").is_accept());
    }

    #[test]
    fn test_ebook_variants() {
        assert!(mentions_book("An ebook on things"));
        assert!(mentions_book("An E-Book on things"));
        assert!(mentions_book("BOOK REVIEW"));
        assert!(!mentions_book("Facebook usage among teenagers"));
        assert!(!mentions_book("bookkeeping"));
    }

    #[test]
    fn test_whitespace_handling() {
        assert_eq!(word_count("  one\ttwo \n three   four  five "), 5);
        assert_eq!(word_count(""), 0);
    }

    proptest! {
        #[test]
        fn prop_short_titles_always_rejected(words in prop::collection::vec("[a-z]{1,10}", 1..5)) {
            let title = words.join(" ");
            prop_assert_eq!(evaluate(&title), PrefilterVerdict::Reject(RejectReason::ShortTitlePre));
        }

        #[test]
        fn prop_book_suffixed_words_never_match(prefix in "[a-z]{1,8}") {
            let title = format!("Results from the {prefix}book cohort study");
            prop_assert!(!mentions_book(&title) || prefix == "e");
        }

        #[test]
        fn prop_long_titles_without_book_accepted(words in prop::collection::vec("[c-z]{3,10}", 5..12)) {
            let title = words.join(" ");
            prop_assume!(!title.split(' ').any(|w| w == "book" || w == "ebook"));
            prop_assert!(evaluate(&title).is_accept());
        }
    }
}
