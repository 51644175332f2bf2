use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags, OptionalExtension, Row, params};
use serde_json::Map;
use tracing::debug;

use super::migrations::{self, CURRENT_SCHEMA};
use super::query::{MetadataFilter, SqlBuilder};
use crate::error::{FramewiseError, Result};
use crate::types::{
    AttributeCondition, AttributeOptions, BigramScore, Document, DocumentId, FieldFilter, Frame,
    FrameId, FramePayload, FrequencyVectors, IdRange, MetadataIndex, MetadataOptions,
    PluginId, PluginRecord, PositionsIndex, RankKey, Revision, Scalar, ScoredHit, SearchQuery,
    Skipgram, SkipgramOptions, TermFrequencies,
};

const SEARCH_DRIVER: &str = "
    create temporary table term_search_driver (
        term_id integer not null,
        all_id integer,
        n_id integer,
        exclude_count integer not null,
        weight real not null
    )
";

/// Ranked pagination or id-window filtering for term searches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SearchMode {
    /// Order by `(score desc, id asc)`, continuing strictly after `after`.
    Rank { after: Option<RankKey> },
    /// Order by id inside `range`.
    Filter { range: IdRange },
}

/// One row of the search driver: a term variant and the role it plays.
#[derive(Debug)]
struct DriverRow<'q> {
    term: &'q str,
    all_id: Option<i64>,
    n_id: Option<i64>,
    exclude: bool,
}

/// Read-only view of the store, fixed to the snapshot taken at [`SqliteReader::begin`].
#[derive(Debug)]
pub struct SqliteReader {
    path: PathBuf,
    db: Option<Connection>,
}

impl SqliteReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FramewiseError::StorageNotFound {
                path: path.to_path_buf(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            db: None,
        })
    }

    /// Open the read transaction. Every later call sees the same snapshot.
    pub fn begin(&mut self) -> Result<()> {
        if self.db.is_some() {
            return Err(FramewiseError::invalid_state("reader already begun"));
        }
        let db = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        db.execute_batch(SEARCH_DRIVER)?;
        db.execute_batch("begin")?;
        let on_disk = migrations::schema_version(&db, "main")?;
        if on_disk != i64::from(CURRENT_SCHEMA) {
            return Err(FramewiseError::SchemaMismatch {
                on_disk,
                expected: CURRENT_SCHEMA,
            });
        }
        debug!(path = %self.path.display(), "reader snapshot opened");
        self.db = Some(db);
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        if let Some(db) = self.db.take() {
            db.execute_batch("rollback")?;
            db.close().map_err(|(_, err)| FramewiseError::from(err))?;
        }
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&self) -> Result<&Connection> {
        self.db
            .as_ref()
            .ok_or_else(|| FramewiseError::invalid_state("reader not begun"))
    }

    fn query_vec<T, F>(&self, sql: &SqlBuilder, map: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn()?.prepare(sql.sql())?;
        let rows = stmt
            .query_map(sql.params(), map)?
            .collect::<rusqlite::Result<Vec<T>>>()?;
        Ok(rows)
    }

    fn query_one<T, F>(&self, sql: &SqlBuilder, map: F) -> Result<T>
    where
        F: FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    {
        Ok(self.conn()?.query_row(sql.sql(), sql.params(), map)?)
    }

    pub fn revision(&self) -> Result<Revision> {
        Ok(self.conn()?.query_row(
            "select revision_number, added_document_count, deleted_document_count
             from index_revision order by revision_number desc limit 1",
            [],
            |row| {
                Ok(Revision {
                    number: row.get(0)?,
                    added_documents: row.get(1)?,
                    deleted_documents: row.get(2)?,
                })
            },
        )?)
    }

    pub fn structured_fields(&self) -> Result<Vec<String>> {
        let mut sql = SqlBuilder::new();
        sql.push("select name from structured_field order by id");
        self.query_vec(&sql, |row| row.get(0))
    }

    pub fn unstructured_fields(&self) -> Result<Vec<String>> {
        let mut sql = SqlBuilder::new();
        sql.push("select name from unstructured_field order by id");
        self.query_vec(&sql, |row| row.get(0))
    }

    // -- counts ---------------------------------------------------------------

    pub fn count_documents(&self) -> Result<u64> {
        let mut sql = SqlBuilder::new();
        sql.push("select count(*) from document");
        self.query_one(&sql, |row| row.get::<_, i64>(0)).map(to_count)
    }

    pub fn count_frames(&self, fields: &FieldFilter) -> Result<u64> {
        let mut sql = SqlBuilder::new();
        sql.push("select count(*) from frame where 1")
            .push_field_filter("field_id", fields);
        self.query_one(&sql, |row| row.get::<_, i64>(0)).map(to_count)
    }

    /// Terms occurring in at least one live frame of the selected fields.
    pub fn count_vocabulary(&self, fields: &FieldFilter) -> Result<u64> {
        let mut sql = SqlBuilder::new();
        sql.push("select count(*) from (select term_id from term_statistics where 1")
            .push_field_filter("field_id", fields)
            .push(" group by term_id having sum(frames_occurring) > 0)");
        self.query_one(&sql, |row| row.get::<_, i64>(0)).map(to_count)
    }

    // -- documents and frames -------------------------------------------------

    pub fn iterate_documents(&self, ids: Option<&[DocumentId]>) -> Result<Vec<Document>> {
        let mut sql = SqlBuilder::new();
        sql.push("select id, stored from document where 1");
        if let Some(ids) = ids {
            sql.push(" and id in (").bind_list(ids.iter().copied()).push(")");
        }
        sql.push(" order by id");
        self.query_vec(&sql, |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .into_iter()
            .map(|(id, stored)| {
                Ok(Document {
                    id,
                    fields: serde_json::from_str(&stored)?,
                })
            })
            .collect()
    }

    pub fn get_document(&self, id: DocumentId) -> Result<Document> {
        self.iterate_documents(Some(&[id][..]))?
            .into_iter()
            .next()
            .ok_or(FramewiseError::DocumentNotFound { id })
    }

    /// Frames with their payload and attributes, ordered by id.
    pub fn iterate_frames(
        &self,
        fields: &FieldFilter,
        ids: Option<&[FrameId]>,
    ) -> Result<Vec<Frame>> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select frame.id, frame.document_id, uf.name, frame.sequence, frame.stored, a.type, a.value
             from frame
             inner join unstructured_field uf on uf.id = frame.field_id
             left join attribute_posting ap on ap.frame_id = frame.id
             left join attribute a on a.id = ap.attribute_id
             where 1",
        )
        .push_field_filter("frame.field_id", fields);
        if let Some(ids) = ids {
            sql.push(" and frame.id in (").bind_list(ids.iter().copied()).push(")");
        }
        sql.push(" order by frame.id, a.type");

        let rows = self.query_vec(&sql, |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<Scalar>>(6)?,
            ))
        })?;

        let mut frames: Vec<Frame> = Vec::new();
        for (id, document_id, field, sequence, stored, attribute, value) in rows {
            if frames.last().map(|frame| frame.id) != Some(id) {
                let payload: Option<FramePayload> =
                    stored.as_deref().map(serde_json::from_str).transpose()?;
                let (text, shell) = payload.map_or((None, Map::new()), |p| (p.text, p.shell));
                frames.push(Frame {
                    id,
                    document_id,
                    field,
                    sequence_number: sequence,
                    text,
                    shell,
                    attributes: BTreeMap::new(),
                });
            }
            if let (Some(attribute), Some(value), Some(frame)) = (attribute, value, frames.last_mut())
            {
                frame.attributes.insert(attribute, value);
            }
        }
        Ok(frames)
    }

    pub fn get_frame(&self, id: FrameId) -> Result<Frame> {
        self.iterate_frames(&FieldFilter::All, Some(&[id][..]))?
            .into_iter()
            .next()
            .ok_or(FramewiseError::FrameNotFound { id })
    }

    // -- positions and frequencies --------------------------------------------

    pub fn iterate_positions(
        &self,
        fields: &FieldFilter,
        terms: Option<&[String]>,
    ) -> Result<PositionsIndex> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select v.term, tp.frame_id, tp.position
             from term_posting tp
             inner join vocabulary v on v.id = tp.term_id
             inner join frame on frame.id = tp.frame_id
             where 1",
        );
        if let Some(terms) = terms {
            sql.push(" and v.term in (").bind_list(terms.iter().cloned()).push(")");
        }
        sql.push_field_filter("frame.field_id", fields)
            .push(" order by v.term, tp.frame_id, tp.position");

        let mut index = PositionsIndex::new();
        let rows = self.query_vec(&sql, |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, u32>(2)?))
        })?;
        for (term, frame_id, position) in rows {
            index
                .entry(term)
                .or_default()
                .entry(frame_id)
                .or_default()
                .push(position);
        }
        Ok(index)
    }

    /// Number of live frames containing each term.
    pub fn iterate_term_frequencies(
        &self,
        fields: &FieldFilter,
        terms: Option<&[String]>,
    ) -> Result<TermFrequencies> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select v.term, sum(ts.frames_occurring)
             from term_statistics ts
             inner join vocabulary v on v.id = ts.term_id
             where 1",
        );
        if let Some(terms) = terms {
            sql.push(" and v.term in (").bind_list(terms.iter().cloned()).push(")");
        }
        sql.push_field_filter("ts.field_id", fields)
            .push(" group by v.term having sum(ts.frames_occurring) > 0");
        let rows = self.query_vec(&sql, |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        Ok(rows
            .into_iter()
            .map(|(term, frames)| (term, to_count(frames)))
            .collect())
    }

    pub fn iterate_term_frequency_vectors(
        &self,
        fields: &FieldFilter,
        frame_ids: Option<&[FrameId]>,
    ) -> Result<FrequencyVectors> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select fp.frame_id, v.term, count(*)
             from frame_posting fp
             inner join vocabulary v on v.id = fp.term_id
             inner join frame on frame.id = fp.frame_id
             where 1",
        )
        .push_field_filter("frame.field_id", fields);
        if let Some(ids) = frame_ids {
            sql.push(" and fp.frame_id in (").bind_list(ids.iter().copied()).push(")");
        }
        sql.push(" group by fp.frame_id, v.term");

        let mut vectors = FrequencyVectors::new();
        let rows = self.query_vec(&sql, |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;
        for (frame_id, term, count) in rows {
            vectors.entry(frame_id).or_default().insert(term, to_count(count));
        }
        Ok(vectors)
    }

    /// Ordered term pairs whose position gap lies in `[start_offset, end_offset]`.
    pub fn iterate_skipgrams(&self, options: &SkipgramOptions) -> Result<Vec<Skipgram>> {
        if options.start_offset < 1 || options.end_offset < 1 {
            return Err(FramewiseError::invalid_query("skipgram offsets must be at least 1"));
        }
        if options.end_offset < options.start_offset {
            return Err(FramewiseError::invalid_query(
                "skipgram end_offset must not be less than start_offset",
            ));
        }
        let mut sql = SqlBuilder::new();
        sql.push(
            "select l.frame_id, lv.term, rv.term
             from frame_posting l
             inner join frame_posting r on r.frame_id = l.frame_id
                and r.position >= l.position + ",
        )
        .bind(i64::from(options.start_offset))
        .push(" and r.position <= l.position + ")
        .bind(i64::from(options.end_offset))
        .push(
            " inner join frame on frame.id = l.frame_id
             inner join vocabulary lv on lv.id = l.term_id
             inner join vocabulary rv on rv.id = r.term_id
             where 1",
        )
        .push_field_filter("frame.field_id", &options.fields);
        if let Some(frames) = &options.frames {
            sql.push(" and l.frame_id in (").bind_list(frames.iter().copied()).push(")");
        }
        sql.push(" order by l.frame_id, l.position, r.position");
        self.query_vec(&sql, |row| {
            Ok(Skipgram {
                frame_id: row.get(0)?,
                left: row.get(1)?,
                right: row.get(2)?,
            })
        })
    }

    // -- metadata and attributes ----------------------------------------------

    /// Structured values grouped by field and value, broadcast to frames unless
    /// `return_documents` is set.
    pub fn iterate_metadata(&self, options: &MetadataOptions) -> Result<MetadataIndex> {
        let mut sql = SqlBuilder::new();
        if options.return_documents {
            sql.push(
                "select sf.name, dd.value, dd.document_id
                 from document_data dd
                 inner join structured_field sf on sf.id = dd.field_id
                 where 1",
            );
            if !matches!(options.fields, FieldFilter::All) {
                sql.push(" and dd.document_id in (select document_id from frame where 1")
                    .push_field_filter("field_id", &options.fields)
                    .push(")");
            }
            sql.push_range("dd.document_id", options.range);
        } else {
            sql.push(
                "select sf.name, dd.value, frame.id
                 from document_data dd
                 inner join structured_field sf on sf.id = dd.field_id
                 inner join frame on frame.document_id = dd.document_id
                 where 1",
            )
            .push_field_filter("frame.field_id", &options.fields)
            .push_range("frame.id", options.range);
        }
        if let Some(names) = &options.structured_fields {
            sql.push(" and sf.name in (").bind_list(names.iter().cloned()).push(")");
        }
        sql.push(" order by 1, 2, 3");
        let rows = self.query_vec(&sql, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(group_index(rows))
    }

    /// Attribute values grouped by type and value.
    pub fn iterate_attributes(&self, options: &AttributeOptions) -> Result<MetadataIndex> {
        let id_column = if options.return_documents {
            "frame.document_id"
        } else {
            "frame.id"
        };
        let mut sql = SqlBuilder::new();
        sql.push("select distinct a.type, a.value, ")
            .push(id_column)
            .push(
                " from attribute_posting ap
                 inner join attribute a on a.id = ap.attribute_id
                 inner join frame on frame.id = ap.frame_id
                 where 1",
            )
            .push_field_filter("frame.field_id", &options.fields)
            .push_range(id_column, options.range);
        if let Some(types) = &options.attribute_types {
            sql.push(" and a.type in (").bind_list(types.iter().cloned()).push(")");
        }
        sql.push(" order by 1, 2, 3");
        let rows = self.query_vec(&sql, |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
        Ok(group_index(rows))
    }

    /// Structured values of each frame's owning document.
    pub fn frame_metadata(
        &self,
        frame_ids: &[FrameId],
        fields: Option<&[String]>,
    ) -> Result<BTreeMap<FrameId, BTreeMap<String, Scalar>>> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select frame.id, sf.name, dd.value
             from frame
             inner join document_data dd on dd.document_id = frame.document_id
             inner join structured_field sf on sf.id = dd.field_id
             where frame.id in (",
        )
        .bind_list(frame_ids.iter().copied())
        .push(")");
        if let Some(names) = fields {
            sql.push(" and sf.name in (").bind_list(names.iter().cloned()).push(")");
        }
        self.collect_metadata(&sql)
    }

    pub fn document_metadata(
        &self,
        document_ids: &[DocumentId],
        fields: Option<&[String]>,
    ) -> Result<BTreeMap<DocumentId, BTreeMap<String, Scalar>>> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select dd.document_id, sf.name, dd.value
             from document_data dd
             inner join structured_field sf on sf.id = dd.field_id
             where dd.document_id in (",
        )
        .bind_list(document_ids.iter().copied())
        .push(")");
        if let Some(names) = fields {
            sql.push(" and sf.name in (").bind_list(names.iter().cloned()).push(")");
        }
        self.collect_metadata(&sql)
    }

    fn collect_metadata(&self, sql: &SqlBuilder) -> Result<BTreeMap<i64, BTreeMap<String, Scalar>>> {
        let mut out: BTreeMap<i64, BTreeMap<String, Scalar>> = BTreeMap::new();
        let rows = self.query_vec(sql, |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, Scalar>(2)?))
        })?;
        for (id, name, value) in rows {
            out.entry(id).or_default().insert(name, value);
        }
        Ok(out)
    }

    // -- id filters -----------------------------------------------------------

    /// Frame (or document) ids in ascending order inside `range`.
    pub fn filter_range(
        &self,
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
        return_documents: bool,
    ) -> Result<Vec<i64>> {
        let mut sql = SqlBuilder::new();
        if return_documents {
            sql.push("select id from document where 1");
            if !matches!(fields, FieldFilter::All) {
                sql.push(" and id in (select document_id from frame where 1")
                    .push_field_filter("field_id", fields)
                    .push(")");
            }
        } else {
            sql.push("select id from frame where 1")
                .push_field_filter("field_id", fields);
        }
        sql.push_range("id", range).push(" order by id").push_limit(limit);
        self.query_vec(&sql, |row| row.get(0))
    }

    /// Frames with at least one indexed token.
    pub fn iterate_non_empty_frames(
        &self,
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
    ) -> Result<Vec<FrameId>> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "select frame.id from frame
             inner join frame_length fl on fl.frame_id = frame.id
             where fl.n_positions > 0",
        )
        .push_field_filter("frame.field_id", fields)
        .push_range("frame.id", range)
        .push(" order by frame.id")
        .push_limit(limit);
        self.query_vec(&sql, |row| row.get(0))
    }

    /// Ids matching every metadata predicate, ascending.
    pub fn filter_metadata(
        &self,
        metadata: &MetadataFilter,
        fields: &FieldFilter,
        return_documents: bool,
        range: IdRange,
        limit: Option<usize>,
    ) -> Result<Vec<i64>> {
        if metadata.is_empty() {
            return Err(FramewiseError::invalid_query("no metadata predicates given"));
        }
        let mut sql = SqlBuilder::new();
        if return_documents {
            sql.push("select id from (select document_id as id from (");
            metadata.render_document_ids(&mut sql);
            sql.push(")) where 1");
            if !matches!(fields, FieldFilter::All) {
                sql.push(" and id in (select document_id from frame where 1")
                    .push_field_filter("field_id", fields)
                    .push(")");
            }
            sql.push_range("id", range).push(" order by id");
        } else {
            sql.push("select frame.id from frame where frame.document_id in (");
            metadata.render_document_ids(&mut sql);
            sql.push(")")
                .push_field_filter("frame.field_id", fields)
                .push_range("frame.id", range)
                .push(" order by frame.id");
        }
        sql.push_limit(limit);
        debug!(sql = sql.sql(), "metadata filter compiled");
        self.query_vec(&sql, |row| row.get(0))
    }

    /// Frames (or documents) whose attributes satisfy every condition.
    /// Only the ordering operators are answerable from the attribute index.
    pub fn filter_attributes(
        &self,
        conditions: &[AttributeCondition],
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
        return_documents: bool,
    ) -> Result<Vec<i64>> {
        if conditions.is_empty() {
            return Err(FramewiseError::invalid_query("no attribute conditions given"));
        }
        let mut matching = SqlBuilder::new();
        for (i, condition) in conditions.iter().enumerate() {
            if !condition.operator.is_ordering() {
                return Err(FramewiseError::UnsupportedOperator {
                    operator: condition.operator.to_string(),
                    field: condition.attribute_type.clone(),
                });
            }
            if i > 0 {
                matching.push(" intersect ");
            }
            matching
                .push(
                    "select ap.frame_id from attribute_posting ap
                     inner join attribute a on a.id = ap.attribute_id
                     where a.type = ",
                )
                .bind(condition.attribute_type.clone())
                .push(" and a.value ")
                .push(condition.operator.as_str())
                .push(" ")
                .bind(condition.value.clone());
        }

        let mut sql = SqlBuilder::new();
        if return_documents {
            sql.push("select id from (select distinct frame.document_id as id from frame where frame.id in (");
        } else {
            sql.push("select id from (select frame.id as id from frame where frame.id in (");
        }
        sql.append(matching)
            .push(")")
            .push_field_filter("frame.field_id", fields)
            .push(") where 1")
            .push_range("id", range)
            .push(" order by id")
            .push_limit(limit);
        self.query_vec(&sql, |row| row.get(0))
    }

    // -- term search ----------------------------------------------------------

    /// Boolean term search with optional metadata restriction.
    ///
    /// Variants in one group share a search id, so a group counts once towards
    /// `must` and `at_least_n` however many variants match. Every matching
    /// variant still contributes to the score.
    pub fn rank_or_filter_unstructured(
        &self,
        query: &SearchQuery,
        metadata: &MetadataFilter,
        mode: SearchMode,
    ) -> Result<Vec<ScoredHit>> {
        if !query.has_terms() && metadata.is_empty() {
            return Err(FramewiseError::invalid_query("query has no terms and no metadata"));
        }
        if matches!(mode, SearchMode::Rank { .. }) && !query.has_positive_terms() {
            return Err(FramewiseError::invalid_query(
                "ranking requires must, should or at_least_n terms",
            ));
        }
        if !query.must_not.is_empty() && !query.has_positive_terms() {
            return Err(FramewiseError::invalid_query(
                "must_not requires must, should or at_least_n terms",
            ));
        }
        if let (false, SearchMode::Filter { range }) = (query.has_terms(), mode) {
            let ids = self.filter_metadata(
                metadata,
                &query.fields,
                query.return_documents,
                range,
                query.limit,
            )?;
            return Ok(ids.into_iter().map(|id| ScoredHit { id, score: 0.0 }).collect());
        }

        let rows = driver_rows(query);
        if !self.load_search_driver(query, &rows)? {
            debug!("no query term occurs in the index");
            return Ok(Vec::new());
        }

        let group_column = if query.return_documents {
            "document_id"
        } else {
            "frame_id"
        };
        let frequency = if query.scoring.binarised() { "1" } else { "tf" };
        let normalise = if query.normalise_length {
            " * 1.0 / n_positions"
        } else {
            ""
        };

        let mut sql = SqlBuilder::new();
        sql.push(
            "with matches as (
                select post.frame_id as frame_id, frame.document_id as document_id,
                    ts.all_id as all_id, ts.n_id as n_id, ts.exclude_count as exclude_count,
                    ts.weight as weight, count(*) as tf, fl.n_positions as n_positions
                from temp.term_search_driver ts
                inner join term_posting post on post.term_id = ts.term_id
                inner join frame on frame.id = post.frame_id
                left join frame_length fl on fl.frame_id = frame.id
                where 1",
        )
        .push_field_filter("frame.field_id", &query.fields);
        if !metadata.is_empty() {
            sql.push(" and frame.document_id in (");
            metadata.render_document_ids(&mut sql);
            sql.push(")");
        }
        sql.push(" group by post.frame_id, ts.rowid) select id, score from (select ")
            .push(group_column)
            .push(" as id, sum(")
            .push(frequency)
            .push(" * weight")
            .push(normalise)
            .push(") as score from matches group by ")
            .push(group_column)
            .push(" having count(distinct all_id) = ")
            .bind(query.must.len() as i64)
            .push(" and count(distinct n_id) >= ")
            .bind(query.at_least_n.as_ref().map_or(0, |a| a.n as i64))
            .push(" and max(exclude_count) = 0) where 1");

        match mode {
            SearchMode::Rank { after } => {
                if let Some(after) = after {
                    sql.push(" and (score < ")
                        .bind(after.score)
                        .push(" or (score = ")
                        .bind(after.score)
                        .push(" and id > ")
                        .bind(after.id)
                        .push("))");
                }
                sql.push(" order by score desc, id");
            }
            SearchMode::Filter { range } => {
                sql.push_range("id", range).push(" order by id");
            }
        }
        sql.push_limit(query.limit);
        debug!(sql = sql.sql(), "term search compiled");

        self.query_vec(&sql, |row| {
            Ok(ScoredHit {
                id: row.get(0)?,
                score: row.get(1)?,
            })
        })
    }

    /// Fill the driver table. Returns false when the query cannot match.
    fn load_search_driver(&self, query: &SearchQuery, rows: &[DriverRow<'_>]) -> Result<bool> {
        let conn = self.conn()?;
        let mut total = SqlBuilder::new();
        total
            .push("select coalesce(sum(frame_count), 0) from field_statistics where 1")
            .push_field_filter("field_id", &query.fields);
        let total_frames: f64 = self.query_one(&total, |row| row.get::<_, i64>(0))? as f64;

        conn.execute("delete from temp.term_search_driver", [])?;
        let mut insert = conn.prepare_cached(
            "insert into temp.term_search_driver (term_id, all_id, n_id, exclude_count, weight)
             values (?1, ?2, ?3, ?4, ?5)",
        )?;
        let mut matched_must: Vec<i64> = Vec::new();
        let mut any_positive = false;
        for row in rows {
            let Some(term_id) = self.term_id(row.term)? else {
                continue;
            };
            let weight = if query.scoring.uses_idf() {
                // frame frequency spans every field; only the frame total is scoped
                let mut frequency = SqlBuilder::new();
                frequency
                    .push("select coalesce(sum(frames_occurring), 0) from term_statistics where term_id = ")
                    .bind(term_id);
                let frames = self.query_one(&frequency, |r| r.get::<_, i64>(0))? as f64;
                1.0 + (total_frames / (frames + 1.0)).ln()
            } else {
                1.0
            };
            insert.execute(params![
                term_id,
                row.all_id,
                row.n_id,
                i64::from(row.exclude),
                weight
            ])?;
            if !row.exclude {
                any_positive = true;
            }
            if let Some(all_id) = row.all_id {
                if !matched_must.contains(&all_id) {
                    matched_must.push(all_id);
                }
            }
        }
        Ok(any_positive && matched_must.len() == query.must.len())
    }

    fn term_id(&self, term: &str) -> Result<Option<i64>> {
        Ok(self
            .conn()?
            .query_row("select id from vocabulary where term = ?1", [term], |row| row.get(0))
            .optional()?)
    }

    // -- n-grams --------------------------------------------------------------

    /// Frames containing any of the given adjacent pairs, scored by the sum of
    /// each pair's inverse frame frequency. Ascending by frame id.
    pub fn iterate_ngram_frames(
        &self,
        bigrams: &[(String, String)],
        fields: &FieldFilter,
        range: IdRange,
        limit: Option<usize>,
    ) -> Result<Vec<ScoredHit>> {
        let total_frames = self.count_frames(fields)? as f64;
        let mut scores: BTreeMap<FrameId, f64> = BTreeMap::new();
        for (left, right) in bigrams {
            let mut sql = SqlBuilder::new();
            sql.push(
                "select distinct l.frame_id
                 from frame_posting l
                 inner join frame_posting r on r.frame_id = l.frame_id and r.position = l.position + 1
                 inner join frame on frame.id = l.frame_id
                 where l.term_id = (select id from vocabulary where term = ",
            )
            .bind(left.clone())
            .push(") and r.term_id = (select id from vocabulary where term = ")
            .bind(right.clone())
            .push(")")
            .push_field_filter("frame.field_id", fields);
            let frames: Vec<FrameId> = self.query_vec(&sql, |row| row.get(0))?;
            let weight = 1.0 + (total_frames / (frames.len() as f64 + 1.0)).ln();
            for frame in frames {
                *scores.entry(frame).or_default() += weight;
            }
        }
        let hits = scores
            .into_iter()
            .filter(|(id, _)| range.after.is_none_or(|after| *id > after))
            .filter(|(id, _)| range.upto.is_none_or(|upto| *id <= upto))
            .map(|(id, score)| ScoredHit { id, score })
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        Ok(hits)
    }

    /// Adjacent term pairs scored `bigram_frames * vocabulary / (left * right)`.
    pub fn find_significant_bigrams(
        &self,
        fields: &FieldFilter,
        min_count: u64,
        threshold: f64,
    ) -> Result<Vec<BigramScore>> {
        let mut sql = SqlBuilder::new();
        sql.push(
            "with bigrams as (
                select l.term_id as left_id, r.term_id as right_id,
                    count(distinct l.frame_id) as frames
                from frame_posting l
                inner join frame_posting r on r.frame_id = l.frame_id and r.position = l.position + 1
                inner join frame on frame.id = l.frame_id
                where 1",
        )
        .push_field_filter("frame.field_id", fields)
        .push(" group by l.term_id, r.term_id having count(distinct l.frame_id) > ")
        .bind(i64::try_from(min_count).unwrap_or(i64::MAX))
        .push(
            "), unigrams as (
                select term_id, sum(frames_occurring) as frames
                from term_statistics where 1",
        )
        .push_field_filter("field_id", fields)
        .push(
            " group by term_id having sum(frames_occurring) > 0
            ), scored as (
                select lv.term as left_term, rv.term as right_term,
                    lu.frames as left_frames, ru.frames as right_frames, b.frames as bigram_frames,
                    b.frames * (select count(*) from unigrams) * 1.0 / (lu.frames * ru.frames) as score
                from bigrams b
                inner join unigrams lu on lu.term_id = b.left_id
                inner join unigrams ru on ru.term_id = b.right_id
                inner join vocabulary lv on lv.id = b.left_id
                inner join vocabulary rv on rv.id = b.right_id
            )
            select left_term, right_term, left_frames, right_frames, bigram_frames, score
            from scored where score > ",
        )
        .bind(threshold)
        .push(" order by score desc, left_term, right_term");

        self.query_vec(&sql, |row| {
            Ok(BigramScore {
                left: row.get(0)?,
                right: row.get(1)?,
                left_frames: to_count(row.get(2)?),
                right_frames: to_count(row.get(3)?),
                bigram_frames: to_count(row.get(4)?),
                score: row.get(5)?,
                npmi: None,
            })
        })
    }

    // -- settings and plugins -------------------------------------------------

    pub fn get_settings(&self, names: Option<&[String]>) -> Result<BTreeMap<String, String>> {
        let mut sql = SqlBuilder::new();
        sql.push("select name, value from setting where 1");
        if let Some(names) = names {
            sql.push(" and name in (").bind_list(names.iter().cloned()).push(")");
        }
        Ok(self
            .query_vec(&sql, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .into_iter()
            .collect())
    }

    pub fn get_setting(&self, name: &str) -> Result<String> {
        self.conn()?
            .query_row("select value from setting where name = ?1", [name], |row| row.get(0))
            .optional()?
            .ok_or_else(|| FramewiseError::SettingNotFound {
                name: name.to_owned(),
            })
    }

    pub fn get_plugin_state(&self, plugin_type: &str, settings: &str) -> Result<PluginRecord> {
        let id: Option<PluginId> = self
            .conn()?
            .query_row(
                "select plugin_id from plugin_registry where plugin_type = ?1 and settings = ?2",
                [plugin_type, settings],
                |row| row.get(0),
            )
            .optional()?;
        let id = id.ok_or_else(|| FramewiseError::PluginNotFound {
            plugin: format!("{plugin_type} {settings}"),
        })?;
        self.get_plugin_by_id(id)
    }

    pub fn get_plugin_by_id(&self, id: PluginId) -> Result<PluginRecord> {
        let conn = self.conn()?;
        let (plugin_type, settings): (String, String) = conn
            .query_row(
                "select plugin_type, settings from plugin_registry where plugin_id = ?1",
                [id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| FramewiseError::PluginNotFound {
                plugin: format!("id {id}"),
            })?;
        let mut state = SqlBuilder::new();
        state
            .push("select key, value from plugin_data where plugin_id = ")
            .bind(id);
        Ok(PluginRecord {
            id,
            plugin_type,
            settings,
            state: self
                .query_vec(&state, |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .into_iter()
                .collect(),
        })
    }

    /// Registered plugin instances, without their state.
    pub fn list_plugin_state(&self) -> Result<Vec<PluginRecord>> {
        let mut sql = SqlBuilder::new();
        sql.push("select plugin_id, plugin_type, settings from plugin_registry order by plugin_id");
        self.query_vec(&sql, |row| {
            Ok(PluginRecord {
                id: row.get(0)?,
                plugin_type: row.get(1)?,
                settings: row.get(2)?,
                state: BTreeMap::new(),
            })
        })
    }
}

fn driver_rows(query: &SearchQuery) -> Vec<DriverRow<'_>> {
    let mut rows = Vec::new();
    let mut search_id = 0_i64;
    for group in &query.must {
        search_id += 1;
        rows.extend(group.variants().iter().map(|term| DriverRow {
            term,
            all_id: Some(search_id),
            n_id: None,
            exclude: false,
        }));
    }
    if let Some(at_least_n) = &query.at_least_n {
        for group in &at_least_n.terms {
            search_id += 1;
            rows.extend(group.variants().iter().map(|term| DriverRow {
                term,
                all_id: None,
                n_id: Some(search_id),
                exclude: false,
            }));
        }
    }
    for group in &query.must_not {
        rows.extend(group.variants().iter().map(|term| DriverRow {
            term,
            all_id: None,
            n_id: None,
            exclude: true,
        }));
    }
    for group in &query.should {
        rows.extend(group.variants().iter().map(|term| DriverRow {
            term,
            all_id: None,
            n_id: None,
            exclude: false,
        }));
    }
    rows
}

fn group_index(rows: Vec<(String, Scalar, i64)>) -> MetadataIndex {
    let mut index = MetadataIndex::new();
    for (name, value, id) in rows {
        let entries = index.entry(name).or_default();
        match entries.last_mut() {
            Some((last, ids)) if *last == value => ids.push(id),
            _ => entries.push((value, vec![id])),
        }
    }
    index
}

fn to_count(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Operator;
    use crate::storage::Comparison;
    use crate::storage::{AnalyzedDocument, SqliteWriter};
    use crate::types::TermGroup;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Frames: 1 {cat, dog}, 2 {cat}, 3 {dog}; one document per frame.
    fn fixture() -> (TempDir, SqliteReader) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        let mut writer = SqliteWriter::create(&path).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        for (year, terms) in [(2001, vec!["cat", "dog"]), (2002, vec!["cat"]), (2003, vec!["dog"])] {
            writer
                .add_analyzed_document(AnalyzedDocument::V1 {
                    document: "{}".into(),
                    structured: BTreeMap::from([("year".to_owned(), Scalar::Integer(year))]),
                    frames: BTreeMap::from([("text".to_owned(), vec![
                        r#"{"field":"text","sequence_number":0}"#.to_owned(),
                    ])]),
                    frame_terms: BTreeMap::from([(
                        "text".to_owned(),
                        vec![terms.into_iter().map(str::to_owned).collect()],
                    )]),
                })
                .unwrap();
        }
        writer.commit().unwrap();
        writer.close().unwrap();
        let mut reader = SqliteReader::open(&path).unwrap();
        reader.begin().unwrap();
        (dir, reader)
    }

    fn ids(hits: &[ScoredHit]) -> Vec<i64> {
        let mut ids: Vec<i64> = hits.iter().map(|h| h.id).collect();
        ids.sort_unstable();
        ids
    }

    fn filter(reader: &SqliteReader, query: &SearchQuery) -> Vec<i64> {
        let hits = reader
            .rank_or_filter_unstructured(
                query,
                &MetadataFilter::new(),
                SearchMode::Filter {
                    range: IdRange::all(),
                },
            )
            .unwrap();
        ids(&hits)
    }

    #[test]
    fn boolean_roles_combine() {
        let (_dir, reader) = fixture();
        assert_eq!(filter(&reader, &SearchQuery::builder().must("cat").build()), vec![1, 2]);
        assert_eq!(
            filter(&reader, &SearchQuery::builder().must("cat").must_not("dog").build()),
            vec![2]
        );
        assert_eq!(
            filter(&reader, &SearchQuery::builder().at_least_n(1, ["cat", "dog"]).build()),
            vec![1, 2, 3]
        );
        assert_eq!(
            filter(&reader, &SearchQuery::builder().at_least_n(2, ["cat", "dog"]).build()),
            vec![1]
        );
    }

    #[test]
    fn variant_group_counts_once_for_must() {
        let (_dir, reader) = fixture();
        let query = SearchQuery::builder()
            .must(TermGroup::new(["cat", "dog"]))
            .build();
        assert_eq!(filter(&reader, &query), vec![1, 2, 3]);
    }

    #[test]
    fn missing_must_term_short_circuits() {
        let (_dir, reader) = fixture();
        let query = SearchQuery::builder().must("cat").must("zebra").build();
        assert!(filter(&reader, &query).is_empty());
    }

    #[test]
    fn query_shape_is_validated() {
        let (_dir, reader) = fixture();
        let rank = SearchMode::Rank { after: None };
        let none = MetadataFilter::new();
        assert!(matches!(
            reader.rank_or_filter_unstructured(&SearchQuery::default(), &none, rank),
            Err(FramewiseError::InvalidQuery { .. })
        ));
        let must_not_only = SearchQuery::builder().must_not("cat").build();
        assert!(matches!(
            reader.rank_or_filter_unstructured(
                &must_not_only,
                &none,
                SearchMode::Filter {
                    range: IdRange::all()
                }
            ),
            Err(FramewiseError::InvalidQuery { .. })
        ));
        let metadata = none.with("year", Comparison::Gt(Scalar::Integer(2000)));
        assert!(reader
            .rank_or_filter_unstructured(&SearchQuery::default(), &metadata, rank)
            .is_err());
    }

    #[test]
    fn metadata_restricts_term_search() {
        let (_dir, reader) = fixture();
        let metadata = MetadataFilter::new().with("year", Comparison::Ge(Scalar::Integer(2002)));
        let hits = reader
            .rank_or_filter_unstructured(
                &SearchQuery::builder().should("cat").should("dog").build(),
                &metadata,
                SearchMode::Rank { after: None },
            )
            .unwrap();
        assert_eq!(ids(&hits), vec![2, 3]);
    }

    #[test]
    fn tf_idf_prefers_rarer_terms() {
        let (_dir, reader) = fixture();
        let hits = reader
            .rank_or_filter_unstructured(
                &SearchQuery::builder().should("cat").build(),
                &MetadataFilter::new(),
                SearchMode::Rank { after: None },
            )
            .unwrap();
        // 3 frames, cat occurs in 2: 1 + ln(3 / 3) = 1
        assert_eq!(hits.len(), 2);
        assert!((hits[0].score - 1.0).abs() < 1e-9);
        assert_eq!(hits[0].id, 1);
    }

    #[test]
    fn filter_metadata_and_range() {
        let (_dir, reader) = fixture();
        let metadata = MetadataFilter::new().with(
            "year",
            Comparison::from_operator(
                Operator::Between,
                vec![Scalar::Integer(2001), Scalar::Integer(2002)],
            )
            .unwrap(),
        );
        let all = reader
            .filter_metadata(&metadata, &FieldFilter::All, true, IdRange::all(), None)
            .unwrap();
        assert_eq!(all, vec![1, 2]);
        let frames = reader
            .filter_metadata(&metadata, &FieldFilter::All, false, IdRange::after(1), None)
            .unwrap();
        assert_eq!(frames, vec![2]);
    }

    #[test]
    fn counts_and_positions() {
        let (_dir, reader) = fixture();
        assert_eq!(reader.count_documents().unwrap(), 3);
        assert_eq!(reader.count_frames(&FieldFilter::All).unwrap(), 3);
        assert_eq!(reader.count_frames(&FieldFilter::only("title")).unwrap(), 0);
        assert_eq!(reader.count_vocabulary(&FieldFilter::All).unwrap(), 2);

        let positions = reader.iterate_positions(&FieldFilter::All, None).unwrap();
        assert_eq!(positions["dog"][&1], vec![1]);
        assert_eq!(positions["dog"][&3], vec![0]);

        let frequencies = reader.iterate_term_frequencies(&FieldFilter::All, None).unwrap();
        assert_eq!(frequencies["cat"], 2);
    }

    #[test]
    fn skipgram_offsets_are_validated() {
        let (_dir, reader) = fixture();
        let options = SkipgramOptions {
            start_offset: 2,
            end_offset: 1,
            ..SkipgramOptions::default()
        };
        assert!(reader.iterate_skipgrams(&options).is_err());
        let pairs = reader.iterate_skipgrams(&SkipgramOptions::default()).unwrap();
        assert_eq!(
            pairs,
            vec![Skipgram {
                frame_id: 1,
                left: "cat".into(),
                right: "dog".into()
            }]
        );
    }

    #[test]
    fn missing_lookups_are_typed() {
        let (_dir, reader) = fixture();
        assert!(matches!(
            reader.get_document(42),
            Err(FramewiseError::DocumentNotFound { id: 42 })
        ));
        assert!(matches!(reader.get_frame(42), Err(FramewiseError::FrameNotFound { id: 42 })));
        assert!(matches!(
            reader.get_setting("nope"),
            Err(FramewiseError::SettingNotFound { .. })
        ));
        assert!(reader.get_plugin_by_id(1).unwrap_err().is_not_found());
    }
}
