//! Text analysis used at ingestion time.
//!
//! The index only relies on the shapes defined here: a token stream with a stop
//! flag per token, and ordered paragraph and sentence units. The standard
//! analyser is intentionally plain (Unicode word boundaries, NFKC, a short
//! English stop list).

mod segment;
mod tokenize;

pub use segment::{split_paragraphs, split_sentences};
pub use tokenize::{StandardAnalyser, Token, is_stop_word};
