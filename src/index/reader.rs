use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, info};

use super::analytics::{case_fold_pairs, npmi};
use super::writer::IndexWriter;
use crate::config::IndexConfig;
use crate::constants::DEFAULT_BUSY_TIMEOUT;
use crate::error::{FramewiseError, Result};
use crate::schema::{Field, FieldType, Operator, Schema};
use crate::storage::{Comparison, MetadataFilter, SearchMode, SqliteReader, CURRENT_SCHEMA};
use crate::types::{
    AttributeCondition, AttributeOptions, BigramScore, Document, DocumentId, FieldFilter,
    FilterResults, Frame, FrameId, FrequencyVectors, IdRange, MetadataCondition, MetadataIndex,
    MetadataOptions, NgramOptions, PluginId, PluginRecord, PositionsIndex, RankKey, RankedPage,
    Revision, Scalar, ScoredHit, SearchQuery, Skipgram, SkipgramOptions, TermFrequencies,
};

/// Snapshot query handle for one index directory.
///
/// Everything read between [`IndexReader::begin`] and [`IndexReader::close`]
/// comes from the same committed revision.
#[derive(Debug)]
pub struct IndexReader {
    path: PathBuf,
    config: IndexConfig,
    auto_migrate: bool,
    storage: Option<SqliteReader>,
}

impl IndexReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (config, _) = IndexConfig::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            config,
            auto_migrate: true,
            storage: None,
        })
    }

    /// Migrate an out-of-date store through a short-lived writer on `begin`.
    #[must_use]
    pub fn auto_migrate(mut self, enabled: bool) -> Self {
        self.auto_migrate = enabled;
        self
    }

    pub fn begin(&mut self) -> Result<()> {
        let mut storage = self.config.storage.open_reader(&self.path)?;
        match storage.begin() {
            Err(FramewiseError::SchemaMismatch { on_disk, expected })
                if self.auto_migrate && on_disk < i64::from(CURRENT_SCHEMA) =>
            {
                info!(on_disk, expected, "store out of date, migrating before read");
                let mut writer = IndexWriter::open(&self.path)?;
                writer.begin(Some(DEFAULT_BUSY_TIMEOUT))?;
                writer.close()?;
                storage.begin()?;
            }
            other => other?,
        }
        self.storage = Some(storage);
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        match self.storage.take() {
            Some(storage) => storage.close(),
            None => Ok(()),
        }
    }

    fn storage(&self) -> Result<&SqliteReader> {
        self.storage
            .as_ref()
            .ok_or_else(|| FramewiseError::invalid_state("reader is not begun"))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn get_schema(&self) -> &Schema {
        &self.config.schema
    }

    pub fn get_revision(&self) -> Result<Revision> {
        self.storage()?.revision()
    }

    pub fn structured_fields(&self) -> Result<Vec<String>> {
        self.storage()?.structured_fields()
    }

    pub fn unstructured_fields(&self) -> Result<Vec<String>> {
        self.storage()?.unstructured_fields()
    }

    // -- validation -----------------------------------------------------------

    fn check_text_field(&self, name: &str) -> Result<()> {
        let field = self
            .config
            .schema
            .get(name)
            .ok_or_else(|| FramewiseError::UnknownField {
                field: name.to_owned(),
            })?;
        if !field.indexed() || field.categorical() {
            return Err(FramewiseError::NonIndexedField {
                field: name.to_owned(),
            });
        }
        Ok(())
    }

    fn check_fields(&self, fields: &FieldFilter) -> Result<()> {
        fields
            .names()
            .iter()
            .try_for_each(|name| self.check_text_field(name))
    }

    fn check_structured_field(&self, name: &str) -> Result<&FieldType> {
        let field = self
            .config
            .schema
            .get(name)
            .ok_or_else(|| FramewiseError::UnknownField {
                field: name.to_owned(),
            })?;
        if !field.indexed() || !field.categorical() {
            return Err(FramewiseError::NonIndexedField {
                field: name.to_owned(),
            });
        }
        Ok(field)
    }

    /// Validate metadata conditions against the schema and bind their values.
    fn metadata_filter(&self, conditions: &[MetadataCondition]) -> Result<MetadataFilter> {
        let mut filter = MetadataFilter::new();
        for condition in conditions {
            let field = self.check_structured_field(&condition.field)?;
            if !condition.operator.is_searchable() {
                return Err(FramewiseError::NonSearchableOperator {
                    operator: condition.operator.to_string(),
                });
            }
            if !field.supports(condition.operator) {
                return Err(FramewiseError::UnsupportedOperator {
                    operator: condition.operator.to_string(),
                    field: condition.field.clone(),
                });
            }
            let raw: Vec<&Value> = match (&condition.value, condition.operator) {
                (Value::Array(items), Operator::In | Operator::Between | Operator::NotBetween) => {
                    items.iter().collect()
                }
                (value, _) => vec![value],
            };
            let operands = raw
                .into_iter()
                .map(|value| field.value_of(value))
                .collect::<Result<Vec<Scalar>>>()
                .map_err(|err| {
                    FramewiseError::invalid_query(format!(
                        "bad value for field '{}': {err}",
                        condition.field
                    ))
                })?;
            filter.push(
                condition.field.clone(),
                Comparison::from_operator(condition.operator, operands)?,
            );
        }
        Ok(filter)
    }

    // -- documents and frames -------------------------------------------------

    pub fn get_document(&self, id: DocumentId) -> Result<Document> {
        self.storage()?.get_document(id)
    }

    pub fn get_documents(&self, ids: &[DocumentId]) -> Result<Vec<Document>> {
        self.storage()?.iterate_documents(Some(ids))
    }

    pub fn iterate_documents(&self) -> Result<Vec<Document>> {
        self.storage()?.iterate_documents(None)
    }

    pub fn get_document_count(&self) -> Result<u64> {
        self.storage()?.count_documents()
    }

    pub fn get_frame(&self, id: FrameId) -> Result<Frame> {
        self.storage()?.get_frame(id)
    }

    /// Frames of the selected fields, optionally restricted to `ids`.
    pub fn get_frames(&self, fields: &FieldFilter, ids: Option<&[FrameId]>) -> Result<Vec<Frame>> {
        self.check_fields(fields)?;
        self.storage()?.iterate_frames(fields, ids)
    }

    pub fn get_frame_ids(&self, fields: &FieldFilter) -> Result<Vec<FrameId>> {
        self.check_fields(fields)?;
        self.storage()?.filter_range(fields, IdRange::all(), None, false)
    }

    pub fn get_frame_count(&self, fields: &FieldFilter) -> Result<u64> {
        self.check_fields(fields)?;
        self.storage()?.count_frames(fields)
    }

    // -- positions and frequencies --------------------------------------------

    pub fn get_positions_index(&self, fields: &FieldFilter) -> Result<PositionsIndex> {
        self.check_fields(fields)?;
        self.storage()?.iterate_positions(fields, None)
    }

    pub fn get_term_positions(&self, term: &str, field: &str) -> Result<BTreeMap<FrameId, Vec<u32>>> {
        self.check_text_field(field)?;
        let terms = [term.to_owned()];
        self.storage()?
            .iterate_positions(&FieldFilter::only(field), Some(&terms))?
            .remove(term)
            .ok_or_else(|| FramewiseError::TermNotFound {
                term: term.to_owned(),
                field: field.to_owned(),
            })
    }

    /// Number of frames containing each term.
    pub fn get_frequencies(&self, fields: &FieldFilter) -> Result<TermFrequencies> {
        self.check_fields(fields)?;
        self.storage()?.iterate_term_frequencies(fields, None)
    }

    pub fn get_term_frequency(&self, term: &str, field: &str) -> Result<u64> {
        self.check_text_field(field)?;
        let terms = [term.to_owned()];
        self.storage()?
            .iterate_term_frequencies(&FieldFilter::only(field), Some(&terms))?
            .remove(term)
            .ok_or_else(|| FramewiseError::TermNotFound {
                term: term.to_owned(),
                field: field.to_owned(),
            })
    }

    pub fn get_term_frequency_vectors(
        &self,
        frame_ids: Option<&[FrameId]>,
        fields: &FieldFilter,
    ) -> Result<FrequencyVectors> {
        self.check_fields(fields)?;
        self.storage()?.iterate_term_frequency_vectors(fields, frame_ids)
    }

    pub fn get_vocab_size(&self, fields: &FieldFilter) -> Result<u64> {
        self.check_fields(fields)?;
        self.storage()?.count_vocabulary(fields)
    }

    /// Lower/title-case pairs worth merging; see [`case_fold_pairs`].
    pub fn get_case_fold_terms(
        &self,
        fields: &FieldFilter,
        merge_threshold: f64,
    ) -> Result<Vec<(String, String)>> {
        Ok(case_fold_pairs(&self.get_frequencies(fields)?, merge_threshold))
    }

    // -- metadata and attributes ----------------------------------------------

    pub fn get_metadata(&self, options: &MetadataOptions) -> Result<MetadataIndex> {
        self.check_fields(&options.fields)?;
        if let Some(names) = &options.structured_fields {
            for name in names {
                self.check_structured_field(name)?;
            }
        }
        self.storage()?.iterate_metadata(options)
    }

    pub fn get_frame_metadata(
        &self,
        frame_ids: &[FrameId],
        fields: Option<&[String]>,
    ) -> Result<BTreeMap<FrameId, BTreeMap<String, Scalar>>> {
        self.storage()?.frame_metadata(frame_ids, fields)
    }

    pub fn get_document_metadata(
        &self,
        document_ids: &[DocumentId],
        fields: Option<&[String]>,
    ) -> Result<BTreeMap<DocumentId, BTreeMap<String, Scalar>>> {
        self.storage()?.document_metadata(document_ids, fields)
    }

    pub fn get_attributes(&self, options: &AttributeOptions) -> Result<MetadataIndex> {
        self.check_fields(&options.fields)?;
        self.storage()?.iterate_attributes(options)
    }

    // -- settings and plugins -------------------------------------------------

    pub fn get_setting(&self, name: &str) -> Result<String> {
        self.storage()?.get_setting(name)
    }

    pub fn get_settings(&self, names: Option<&[String]>) -> Result<BTreeMap<String, String>> {
        self.storage()?.get_settings(names)
    }

    pub fn get_plugin_state(&self, plugin_type: &str, settings: &str) -> Result<PluginRecord> {
        self.storage()?.get_plugin_state(plugin_type, settings)
    }

    pub fn get_plugin_by_id(&self, id: PluginId) -> Result<PluginRecord> {
        self.storage()?.get_plugin_by_id(id)
    }

    pub fn list_plugins(&self) -> Result<Vec<PluginRecord>> {
        self.storage()?.list_plugin_state()
    }

    // -- queries --------------------------------------------------------------

    /// Ranked search, one page at a time. Pass the previous page's `next` as
    /// `after` to continue.
    pub fn filter_and_rank(&self, query: &SearchQuery, after: Option<RankKey>) -> Result<RankedPage> {
        if !query.has_positive_terms() {
            return Err(FramewiseError::invalid_query(
                "ranking requires must, should or at_least_n terms",
            ));
        }
        self.check_fields(&query.fields)?;
        let metadata = self.metadata_filter(&query.metadata)?;
        let hits = self.storage()?.rank_or_filter_unstructured(
            query,
            &metadata,
            SearchMode::Rank { after },
        )?;
        let next = match (query.limit, hits.last()) {
            (Some(limit), Some(last)) if hits.len() == limit => Some(last.key()),
            _ => None,
        };
        Ok(RankedPage { hits, next })
    }

    /// Unordered matches inside an id window. Metadata-only matches score 0.
    pub fn filter(&self, query: &SearchQuery, range: IdRange) -> Result<FilterResults> {
        self.check_fields(&query.fields)?;
        let metadata = self.metadata_filter(&query.metadata)?;
        let hits = self.storage()?.rank_or_filter_unstructured(
            query,
            &metadata,
            SearchMode::Filter { range },
        )?;
        Ok(hits.into_iter().map(|hit| (hit.id, vec![hit.score])).collect())
    }

    /// Ids in ascending order; chain calls with the last id as `range.after`.
    pub fn filter_range(
        &self,
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
        return_documents: bool,
    ) -> Result<Vec<i64>> {
        self.check_fields(fields)?;
        self.storage()?.filter_range(fields, range, limit, return_documents)
    }

    pub fn filter_nonempty(
        &self,
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
    ) -> Result<Vec<FrameId>> {
        self.check_fields(fields)?;
        self.storage()?.iterate_non_empty_frames(fields, range, limit)
    }

    pub fn filter_attributes(
        &self,
        conditions: &[AttributeCondition],
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
        return_documents: bool,
    ) -> Result<Vec<i64>> {
        self.check_fields(fields)?;
        self.storage()?
            .filter_attributes(conditions, fields, range, limit, return_documents)
    }

    /// Frames containing any of the space-separated bigrams, scored by the
    /// bigrams' inverse frame frequency.
    pub fn filter_ngrams(
        &self,
        ngrams: &[&str],
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredHit>> {
        self.check_fields(fields)?;
        let pairs = ngrams
            .iter()
            .map(|ngram| {
                let mut words = ngram.split_whitespace();
                match (words.next(), words.next(), words.next()) {
                    (Some(left), Some(right), None) => Ok((left.to_owned(), right.to_owned())),
                    _ => Err(FramewiseError::invalid_query(format!(
                        "'{ngram}' is not a two-word ngram"
                    ))),
                }
            })
            .collect::<Result<Vec<_>>>()?;
        self.storage()?.iterate_ngram_frames(&pairs, fields, range, limit)
    }

    /// Collocations by raw bigram score, or by NPMI when
    /// `options.npmi_threshold` is set.
    pub fn detect_significant_ngrams(&self, options: &NgramOptions) -> Result<Vec<BigramScore>> {
        self.check_fields(&options.fields)?;
        let storage = self.storage()?;
        let Some(npmi_threshold) = options.npmi_threshold else {
            return storage.find_significant_bigrams(
                &options.fields,
                options.min_count,
                options.threshold,
            );
        };

        let corpus = storage.count_frames(&options.fields)?;
        let candidates = storage.find_significant_bigrams(&options.fields, options.min_count, 0.0)?;
        debug!(candidates = candidates.len(), corpus, "scoring bigrams by npmi");
        Ok(candidates
            .into_iter()
            .map(|mut bigram| {
                bigram.npmi = Some(npmi(
                    bigram.bigram_frames,
                    bigram.left_frames,
                    bigram.right_frames,
                    corpus,
                ));
                bigram
            })
            .filter(|bigram| {
                bigram.npmi.is_some_and(|value| value > npmi_threshold)
                    || bigram.score > options.threshold
            })
            .collect())
    }

    pub fn get_skipgrams(&self, options: &SkipgramOptions) -> Result<Vec<Skipgram>> {
        self.check_fields(&options.fields)?;
        self.storage()?.iterate_skipgrams(options)
    }
}
