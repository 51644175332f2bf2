//! Query and result types for search, filtering and analytics.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::common::{FrameId, Scalar};
use crate::constants::{DEFAULT_NGRAM_MIN_COUNT, DEFAULT_NGRAM_THRESHOLD};
use crate::error::FramewiseError;
use crate::schema::Operator;

/// Interchangeable spellings of one logical query term.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TermGroup(Vec<String>);

impl TermGroup {
    pub fn new<I, S>(variants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(variants.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn variants(&self) -> &[String] {
        &self.0
    }
}

impl From<&str> for TermGroup {
    fn from(term: &str) -> Self {
        Self(vec![term.to_owned()])
    }
}

impl From<String> for TermGroup {
    fn from(term: String) -> Self {
        Self(vec![term])
    }
}

impl From<Vec<&str>> for TermGroup {
    fn from(variants: Vec<&str>) -> Self {
        Self::new(variants)
    }
}

impl From<Vec<String>> for TermGroup {
    fn from(variants: Vec<String>) -> Self {
        Self(variants)
    }
}

impl<const N: usize> From<[&str; N]> for TermGroup {
    fn from(variants: [&str; N]) -> Self {
        Self::new(variants)
    }
}

/// Which unstructured fields a query may touch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldFilter {
    #[default]
    All,
    Include(Vec<String>),
    Exclude(Vec<String>),
}

impl FieldFilter {
    pub fn include<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldFilter::Include(fields.into_iter().map(Into::into).collect())
    }

    pub fn exclude<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldFilter::Exclude(fields.into_iter().map(Into::into).collect())
    }

    #[must_use]
    pub fn only(field: &str) -> Self {
        FieldFilter::Include(vec![field.to_owned()])
    }

    #[must_use]
    pub fn names(&self) -> &[String] {
        match self {
            FieldFilter::All => &[],
            FieldFilter::Include(names) | FieldFilter::Exclude(names) => names,
        }
    }
}

/// How matching postings turn into a score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Scoring {
    #[serde(rename = "tf")]
    Tf,
    #[serde(rename = "binarised-tf")]
    BinarisedTf,
    #[default]
    #[serde(rename = "tf-idf")]
    TfIdf,
    #[serde(rename = "binarised-tf-idf")]
    BinarisedTfIdf,
}

impl Scoring {
    #[must_use]
    pub fn uses_idf(self) -> bool {
        matches!(self, Scoring::TfIdf | Scoring::BinarisedTfIdf)
    }

    #[must_use]
    pub fn binarised(self) -> bool {
        matches!(self, Scoring::BinarisedTf | Scoring::BinarisedTfIdf)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Scoring::Tf => "tf",
            Scoring::BinarisedTf => "binarised-tf",
            Scoring::TfIdf => "tf-idf",
            Scoring::BinarisedTfIdf => "binarised-tf-idf",
        }
    }
}

impl fmt::Display for Scoring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scoring {
    type Err = FramewiseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tf" => Ok(Scoring::Tf),
            "binarised-tf" => Ok(Scoring::BinarisedTf),
            "tf-idf" => Ok(Scoring::TfIdf),
            "binarised-tf-idf" => Ok(Scoring::BinarisedTfIdf),
            other => Err(FramewiseError::invalid_query(format!(
                "unknown scoring mode '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtLeastN {
    pub n: usize,
    pub terms: Vec<TermGroup>,
}

/// A predicate over a structured field, before schema validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataCondition {
    pub field: String,
    pub operator: Operator,
    /// Scalar operand, or an array for `in` and the `between` forms.
    pub value: Value,
}

/// Boolean term query with optional metadata restriction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub fields: FieldFilter,
    #[serde(default)]
    pub must: Vec<TermGroup>,
    #[serde(default)]
    pub should: Vec<TermGroup>,
    #[serde(default)]
    pub at_least_n: Option<AtLeastN>,
    #[serde(default)]
    pub must_not: Vec<TermGroup>,
    #[serde(default)]
    pub metadata: Vec<MetadataCondition>,
    /// Aggregate matches per document instead of per frame.
    #[serde(default)]
    pub return_documents: bool,
    #[serde(default)]
    pub scoring: Scoring,
    /// Divide each frame's contribution by its token count.
    #[serde(default)]
    pub normalise_length: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl SearchQuery {
    #[must_use]
    pub fn builder() -> SearchQueryBuilder {
        SearchQueryBuilder::default()
    }

    /// True when must, should or at-least-n carry terms.
    #[must_use]
    pub fn has_positive_terms(&self) -> bool {
        !self.must.is_empty()
            || !self.should.is_empty()
            || self.at_least_n.as_ref().is_some_and(|a| !a.terms.is_empty())
    }

    #[must_use]
    pub fn has_terms(&self) -> bool {
        self.has_positive_terms() || !self.must_not.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchQueryBuilder {
    inner: SearchQuery,
}

impl SearchQueryBuilder {
    pub fn fields(mut self, fields: FieldFilter) -> Self {
        self.inner.fields = fields;
        self
    }

    pub fn must(mut self, term: impl Into<TermGroup>) -> Self {
        self.inner.must.push(term.into());
        self
    }

    pub fn should(mut self, term: impl Into<TermGroup>) -> Self {
        self.inner.should.push(term.into());
        self
    }

    pub fn must_not(mut self, term: impl Into<TermGroup>) -> Self {
        self.inner.must_not.push(term.into());
        self
    }

    pub fn at_least_n<I, T>(mut self, n: usize, terms: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<TermGroup>,
    {
        self.inner.at_least_n = Some(AtLeastN {
            n,
            terms: terms.into_iter().map(Into::into).collect(),
        });
        self
    }

    pub fn metadata(mut self, field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        self.inner.metadata.push(MetadataCondition {
            field: field.into(),
            operator,
            value: value.into(),
        });
        self
    }

    pub fn return_documents(mut self, value: bool) -> Self {
        self.inner.return_documents = value;
        self
    }

    pub fn scoring(mut self, scoring: Scoring) -> Self {
        self.inner.scoring = scoring;
        self
    }

    pub fn normalise_length(mut self, value: bool) -> Self {
        self.inner.normalise_length = value;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.inner.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn build(self) -> SearchQuery {
        self.inner
    }
}

/// Position in a ranked result list: `(score desc, id asc)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RankKey {
    pub score: f64,
    pub id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoredHit {
    pub id: i64,
    pub score: f64,
}

impl ScoredHit {
    #[must_use]
    pub fn key(&self) -> RankKey {
        RankKey {
            score: self.score,
            id: self.id,
        }
    }
}

/// One page of ranked hits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankedPage {
    pub hits: Vec<ScoredHit>,
    /// Cursor for the next page; `None` once the results are exhausted.
    pub next: Option<RankKey>,
}

/// Unordered filter results: id to scores.
pub type FilterResults = BTreeMap<i64, Vec<f64>>;

/// Forward-only id window: `after < id <= upto`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRange {
    pub after: Option<i64>,
    pub upto: Option<i64>,
}

impl IdRange {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn after(id: i64) -> Self {
        Self {
            after: Some(id),
            upto: None,
        }
    }

    #[must_use]
    pub fn between(after: i64, upto: i64) -> Self {
        Self {
            after: Some(after),
            upto: Some(upto),
        }
    }
}

/// Restriction on a frame attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeCondition {
    pub attribute_type: String,
    pub operator: Operator,
    pub value: Scalar,
}

/// Options for iterating structured metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetadataOptions {
    #[serde(default)]
    pub fields: FieldFilter,
    #[serde(default)]
    pub structured_fields: Option<Vec<String>>,
    #[serde(default)]
    pub return_documents: bool,
    #[serde(default)]
    pub range: IdRange,
}

/// Options for iterating frame attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeOptions {
    #[serde(default)]
    pub fields: FieldFilter,
    #[serde(default)]
    pub attribute_types: Option<Vec<String>>,
    #[serde(default)]
    pub return_documents: bool,
    #[serde(default)]
    pub range: IdRange,
}

/// Field name to `(value, ids)` pairs ordered by value.
pub type MetadataIndex = BTreeMap<String, Vec<(Scalar, Vec<i64>)>>;

/// Term to frame to ascending token positions.
pub type PositionsIndex = BTreeMap<String, BTreeMap<FrameId, Vec<u32>>>;

/// Term to the number of frames containing it.
pub type TermFrequencies = BTreeMap<String, u64>;

/// Frame to per-term occurrence counts.
pub type FrequencyVectors = BTreeMap<FrameId, BTreeMap<String, u64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NgramOptions {
    #[serde(default)]
    pub fields: FieldFilter,
    /// Bigrams must occur in more than this many frames.
    pub min_count: u64,
    pub threshold: f64,
    /// Switch to NPMI scoring; pairs pass above this or above `threshold`.
    #[serde(default)]
    pub npmi_threshold: Option<f64>,
}

impl Default for NgramOptions {
    fn default() -> Self {
        Self {
            fields: FieldFilter::All,
            min_count: DEFAULT_NGRAM_MIN_COUNT,
            threshold: DEFAULT_NGRAM_THRESHOLD,
            npmi_threshold: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigramScore {
    pub left: String,
    pub right: String,
    pub left_frames: u64,
    pub right_frames: u64,
    pub bigram_frames: u64,
    pub score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub npmi: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipgramOptions {
    #[serde(default)]
    pub fields: FieldFilter,
    #[serde(default)]
    pub frames: Option<Vec<FrameId>>,
    pub start_offset: u32,
    pub end_offset: u32,
}

impl Default for SkipgramOptions {
    fn default() -> Self {
        Self {
            fields: FieldFilter::All,
            frames: None,
            start_offset: 1,
            end_offset: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skipgram {
    pub frame_id: FrameId,
    pub left: String,
    pub right: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_collects_term_roles() {
        let query = SearchQuery::builder()
            .must("cat")
            .should(["dog", "hound"])
            .must_not("fish")
            .at_least_n(1, ["a", "b"])
            .metadata("year", Operator::Gt, 2000)
            .limit(5)
            .build();
        assert_eq!(query.must, vec![TermGroup::from("cat")]);
        assert_eq!(query.should[0].variants(), ["dog", "hound"]);
        assert_eq!(query.at_least_n.as_ref().unwrap().terms.len(), 2);
        assert_eq!(query.metadata[0].value, serde_json::json!(2000));
        assert!(query.has_positive_terms());
        assert_eq!(query.limit, Some(5));
    }

    #[test]
    fn must_not_alone_is_not_positive() {
        let query = SearchQuery::builder().must_not("x").build();
        assert!(query.has_terms());
        assert!(!query.has_positive_terms());
    }

    #[test]
    fn scoring_names_parse() {
        for mode in [
            Scoring::Tf,
            Scoring::BinarisedTf,
            Scoring::TfIdf,
            Scoring::BinarisedTfIdf,
        ] {
            assert_eq!(mode.as_str().parse::<Scoring>().unwrap(), mode);
        }
        assert!("bm25".parse::<Scoring>().is_err());
        assert!(Scoring::BinarisedTfIdf.uses_idf() && Scoring::BinarisedTfIdf.binarised());
    }
}
