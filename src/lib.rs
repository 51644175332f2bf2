#![deny(clippy::all, clippy::pedantic)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
#![cfg_attr(
    test,
    allow(
        clippy::useless_vec,
        clippy::uninlined_format_args,
        clippy::cast_possible_truncation,
        clippy::float_cmp
    )
)]
#![allow(clippy::module_name_repetitions)]
//
// Documentation lints: query wrappers mostly forward to storage and say what
// they return in their names.
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
//
// Counts and ids move between SQLite's i64, usize lengths and f64 scores.
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
//
// Storage functions that compile one statement read best in one piece.
#![allow(clippy::too_many_lines)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::similar_names)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::len_without_is_empty)]
#![allow(clippy::unnecessary_wraps)]

//! Transactional, frame-level text index.
//!
//! Documents are split into frames (runs of sentences within a paragraph) and
//! every frame's tokens are stored as positional postings in a single SQLite
//! file. One [`IndexWriter`] at a time stages changes behind a directory lock;
//! any number of [`IndexReader`]s query a fixed committed revision.

/// The framewise-core crate version (matches `Cargo.toml`).
pub const FRAMEWISE_CORE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod analysis;
pub mod config;
pub mod constants;
pub mod error;
pub mod index;
mod lock;
pub mod schema;
pub mod storage;
pub mod types;

pub use config::{ConfigFormat, IndexConfig, StorageKind};
pub use error::{FramewiseError, Result};
pub use index::{IndexReader, IndexWriter, WriterState, case_fold_pairs, frame_text, npmi};
pub use lock::FileLock;
pub use schema::{Field, FieldType, NumericKind, Operator, Schema};
pub use types::{
    AttributeCondition, AttributeOptions, BigramScore, CommitSummary, Document, DocumentFields,
    DocumentId, FieldFilter, FilterResults, Frame, FrameId, IdRange, MetadataCondition,
    MetadataOptions, NgramOptions, Plugin, PluginId, PluginRecord, RankKey, RankedPage, Revision,
    Scalar, ScoredHit, Scoring, SearchQuery, Skipgram, SkipgramOptions, TermGroup,
};
