//! Public types exposed by the `framewise-core` crate.

pub mod common;
pub mod search;

pub use common::{
    CommitSummary, Document, DocumentFields, DocumentId, Frame, FrameId, Plugin, PluginId,
    PluginRecord, Revision, Scalar,
};
pub(crate) use common::FramePayload;
pub use search::{
    AtLeastN, AttributeCondition, AttributeOptions, BigramScore, FieldFilter, FilterResults,
    FrequencyVectors, IdRange, MetadataCondition, MetadataIndex, MetadataOptions, NgramOptions,
    PositionsIndex, RankKey, RankedPage, ScoredHit, Scoring, SearchQuery, SearchQueryBuilder,
    Skipgram, SkipgramOptions, TermFrequencies, TermGroup,
};
