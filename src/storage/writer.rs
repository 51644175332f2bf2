use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, OptionalExtension, TransactionBehavior, params};
use tracing::{debug, info, instrument};

use super::migrations::{self, CURRENT_SCHEMA, MigrationRegistry};
use super::scripts;
use crate::error::{FramewiseError, Result};
use crate::types::{CommitSummary, DocumentId, FrameId, Scalar};

/// A document after analysis, ready to be staged.
///
/// `frames` and `frame_terms` are keyed by unstructured field and must line
/// up: one term list per serialized frame. Term positions are list indices.
#[derive(Debug, Clone, PartialEq)]
pub enum AnalyzedDocument {
    V1 {
        document: String,
        structured: BTreeMap<String, Scalar>,
        frames: BTreeMap<String, Vec<String>>,
        frame_terms: BTreeMap<String, Vec<Vec<String>>>,
    },
}

impl AnalyzedDocument {
    fn check_parity(
        frames: &BTreeMap<String, Vec<String>>,
        frame_terms: &BTreeMap<String, Vec<Vec<String>>>,
    ) -> Result<()> {
        if !frames.keys().eq(frame_terms.keys()) {
            return Err(FramewiseError::invalid_document(
                "frames and frame terms cover different fields",
            ));
        }
        for (field, payloads) in frames {
            let terms = frame_terms.get(field).map_or(0, Vec::len);
            if payloads.len() != terms {
                return Err(FramewiseError::invalid_document(format!(
                    "field '{field}' has {} frames but {terms} term lists",
                    payloads.len()
                )));
            }
        }
        Ok(())
    }
}

/// Single writer over the on-disk store.
///
/// Changes are staged in a private in-memory database and copied into the
/// store in one immediate transaction by [`SqliteWriter::commit`].
#[derive(Debug)]
pub struct SqliteWriter {
    path: PathBuf,
    db: Connection,
    staging: Option<Connection>,
    busy_timeout: Duration,
    staged_documents: i64,
    staged_frames: i64,
}

impl SqliteWriter {
    /// Create and fully migrate a new store.
    #[instrument(skip_all, fields(path = %path.as_ref().display()))]
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Err(FramewiseError::DuplicateStorage {
                path: path.to_path_buf(),
            });
        }
        let mut db = Connection::open(path)?;
        let mode: String = db.query_row("pragma journal_mode = wal", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "store created");
        migrations::run(&mut db, &MigrationRegistry::standard())?;
        Ok(Self::with_connection(path, db))
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(FramewiseError::StorageNotFound {
                path: path.to_path_buf(),
            });
        }
        let db = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self::with_connection(path, db))
    }

    fn with_connection(path: &Path, db: Connection) -> Self {
        Self {
            path: path.to_path_buf(),
            db,
            staging: None,
            busy_timeout: crate::constants::DEFAULT_BUSY_TIMEOUT,
            staged_documents: 0,
            staged_frames: 0,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn schema_version(&self) -> Result<i64> {
        migrations::schema_version(&self.db, "main")
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.staging.is_some()
    }

    /// Start staging. Fails with `SchemaMismatch` unless the store is current.
    pub fn begin(&mut self, busy_timeout: Duration) -> Result<()> {
        if self.staging.is_some() {
            return Err(FramewiseError::invalid_state("writer transaction already begun"));
        }
        let on_disk = self.schema_version()?;
        if on_disk != i64::from(CURRENT_SCHEMA) {
            return Err(FramewiseError::SchemaMismatch {
                on_disk,
                expected: CURRENT_SCHEMA,
            });
        }
        self.db.busy_timeout(busy_timeout)?;
        let staging = Connection::open_in_memory()?;
        staging.busy_timeout(busy_timeout)?;
        staging.execute_batch(scripts::STAGING_SCHEMA)?;
        self.staging = Some(staging);
        self.busy_timeout = busy_timeout;
        self.staged_documents = 0;
        self.staged_frames = 0;
        debug!(path = %self.path.display(), "writer transaction begun");
        Ok(())
    }

    fn staging(&self) -> Result<&Connection> {
        self.staging
            .as_ref()
            .ok_or_else(|| FramewiseError::invalid_state("writer transaction not begun"))
    }

    pub fn add_structured_fields<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let staging = self.staging()?;
        let mut insert =
            staging.prepare_cached("insert or ignore into structured_field (name) values (?1)")?;
        for name in names {
            insert.execute([name])?;
        }
        Ok(())
    }

    pub fn add_unstructured_fields<'a>(
        &mut self,
        names: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let staging = self.staging()?;
        let mut insert =
            staging.prepare_cached("insert or ignore into unstructured_field (name) values (?1)")?;
        for name in names {
            insert.execute([name])?;
        }
        Ok(())
    }

    /// Stage one document. Either all of its rows are staged or none are.
    pub fn add_analyzed_document(&mut self, document: AnalyzedDocument) -> Result<()> {
        let AnalyzedDocument::V1 {
            document,
            structured,
            frames,
            frame_terms,
        } = document;

        let local_document = self.staged_documents;
        let mut local_frame = self.staged_frames;
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| FramewiseError::invalid_state("writer transaction not begun"))?;

        let savepoint = staging.savepoint_with_name("document")?;
        savepoint.execute(
            "insert into document (id, stored) values (?1, ?2)",
            params![local_document, document],
        )?;
        {
            let mut insert_data = savepoint.prepare_cached(
                "insert into document_data (document_id, field_name, value) values (?1, ?2, ?3)",
            )?;
            for (field, value) in &structured {
                if *value != Scalar::Null {
                    insert_data.execute(params![local_document, field, value])?;
                }
            }
        }
        AnalyzedDocument::check_parity(&frames, &frame_terms)?;
        {
            let mut insert_frame = savepoint.prepare_cached(
                "insert into frame (id, document_id, field_name, sequence, stored)
                 values (?1, ?2, ?3, ?4, ?5)",
            )?;
            let mut insert_term = savepoint.prepare_cached(
                "insert into frame_term (frame_id, term, position) values (?1, ?2, ?3)",
            )?;
            for (field, payloads) in &frames {
                let terms = frame_terms.get(field).map_or(&[][..], Vec::as_slice);
                for (sequence, (payload, tokens)) in payloads.iter().zip(terms).enumerate() {
                    insert_frame.execute(params![
                        local_frame,
                        local_document,
                        field,
                        sequence as i64,
                        payload
                    ])?;
                    for (position, term) in tokens.iter().enumerate() {
                        insert_term.execute(params![local_frame, term, position as i64])?;
                    }
                    local_frame += 1;
                }
            }
        }
        savepoint.commit()?;

        self.staged_documents += 1;
        self.staged_frames = local_frame;
        Ok(())
    }

    /// Stage attribute values for committed frames. `Null` values are skipped.
    pub fn append_frame_attributes(
        &mut self,
        attributes: &BTreeMap<FrameId, BTreeMap<String, Scalar>>,
    ) -> Result<()> {
        let staging = self.staging()?;
        let mut insert = staging.prepare_cached(
            "insert into attribute_update (frame_id, type, value) values (?1, ?2, ?3)",
        )?;
        for (frame_id, values) in attributes {
            for (attribute_type, value) in values {
                if *value != Scalar::Null {
                    insert.execute(params![frame_id, attribute_type, value])?;
                }
            }
        }
        Ok(())
    }

    pub fn delete_documents(&mut self, ids: &[DocumentId]) -> Result<()> {
        let staging = self.staging()?;
        let mut insert =
            staging.prepare_cached("insert or ignore into deleted_document (id) values (?1)")?;
        for id in ids {
            insert.execute([id])?;
        }
        Ok(())
    }

    /// Replace the full state of one plugin instance.
    pub fn set_plugin_state(
        &mut self,
        plugin_type: &str,
        settings: &str,
        state: &BTreeMap<String, String>,
    ) -> Result<()> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| FramewiseError::invalid_state("writer transaction not begun"))?;
        let savepoint = staging.savepoint_with_name("plugin")?;
        savepoint.execute(
            "insert or ignore into plugin_update (plugin_type, settings) values (?1, ?2)",
            params![plugin_type, settings],
        )?;
        savepoint.execute(
            "delete from plugin_state where plugin_type = ?1 and settings = ?2",
            params![plugin_type, settings],
        )?;
        {
            let mut insert = savepoint.prepare_cached(
                "insert into plugin_state (plugin_type, settings, key, value) values (?1, ?2, ?3, ?4)",
            )?;
            for (key, value) in state {
                insert.execute(params![plugin_type, settings, key, value])?;
            }
        }
        savepoint.commit()?;
        Ok(())
    }

    /// Remove one instance (`settings` given) or every instance of a type.
    pub fn delete_plugin_state(&mut self, plugin_type: &str, settings: Option<&str>) -> Result<()> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| FramewiseError::invalid_state("writer transaction not begun"))?;
        let savepoint = staging.savepoint_with_name("plugin")?;
        savepoint.execute(
            "insert into plugin_delete (plugin_type, settings) values (?1, ?2)",
            params![plugin_type, settings],
        )?;
        for table in ["plugin_update", "plugin_state"] {
            savepoint.execute(
                &format!(
                    "delete from {table} where plugin_type = ?1 and (?2 is null or settings = ?2)"
                ),
                params![plugin_type, settings],
            )?;
        }
        savepoint.commit()?;
        Ok(())
    }

    pub fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        self.staging()?.execute(
            "insert into setting (name, value) values (?1, ?2)",
            params![name, value],
        )?;
        Ok(())
    }

    /// Number of documents staged since the last commit or rollback.
    #[must_use]
    pub fn staged_documents(&self) -> i64 {
        self.staged_documents
    }

    /// Copy everything staged into the store atomically. Staging stays open.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn commit(&mut self) -> Result<CommitSummary> {
        let path = self.path.to_string_lossy().into_owned();
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| FramewiseError::invalid_state("writer transaction not begun"))?;

        staging.execute("attach database ?1 as disk_index", [path])?;
        let flushed = flush(staging);
        let detached = staging.execute_batch("detach database disk_index");
        let summary = flushed?;
        detached?;
        staging.execute_batch(scripts::CLEAR_STAGING)?;
        self.staged_documents = 0;
        self.staged_frames = 0;

        info!(
            added = summary.added_documents.len(),
            deleted = summary.deleted_documents.len(),
            plugins = summary.updated_plugins.len(),
            "commit flushed"
        );
        Ok(summary)
    }

    /// Drop everything staged since the last commit.
    pub fn rollback(&mut self) -> Result<()> {
        if let Some(staging) = self.staging.as_ref() {
            staging.execute_batch(scripts::CLEAR_STAGING)?;
        }
        self.staged_documents = 0;
        self.staged_frames = 0;
        debug!(path = %self.path.display(), "staged changes discarded");
        Ok(())
    }

    /// Run the standard migrations, returning the resulting version.
    pub fn migrate(&mut self) -> Result<i64> {
        self.migrate_with(&MigrationRegistry::standard())
    }

    pub fn migrate_with(&mut self, registry: &MigrationRegistry) -> Result<i64> {
        if self.staging.is_some() {
            return Err(FramewiseError::invalid_state(
                "cannot migrate with a writer transaction open",
            ));
        }
        migrations::run(&mut self.db, registry)
    }

    /// Discard staging and close the store connection.
    pub fn close(mut self) -> Result<()> {
        self.staging = None;
        self.db.close().map_err(|(_, err)| FramewiseError::from(err))
    }
}

fn flush(staging: &mut Connection) -> Result<CommitSummary> {
    let tx = staging.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let on_disk = migrations::schema_version(&tx, "disk_index")?;
    if on_disk != i64::from(CURRENT_SCHEMA) {
        return Err(FramewiseError::SchemaMismatch {
            on_disk,
            expected: CURRENT_SCHEMA,
        });
    }
    let (revision, added_total, deleted_total, frames_total): (i64, i64, i64, i64) = tx
        .query_row(scripts::LATEST_REVISION, [], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()?
        .unwrap_or((0, 0, 0, 0));
    let document_offset = added_total + 1;
    let frame_offset = frames_total + 1;

    let deleted_documents: Vec<DocumentId> = {
        let mut stmt = tx.prepare(scripts::PENDING_DELETES)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        ids
    };
    if !deleted_documents.is_empty() {
        tx.execute_batch(scripts::FLUSH_DELETES)?;
    }

    let staged_documents: i64 = tx.query_row("select count(*) from document", [], |row| row.get(0))?;
    let staged_frames: i64 = tx.query_row("select count(*) from frame", [], |row| row.get(0))?;

    tx.execute_batch(scripts::FLUSH_FIELDS)?;
    tx.execute(scripts::FLUSH_DOCUMENTS, [document_offset])?;
    tx.execute(scripts::FLUSH_DOCUMENT_DATA, [document_offset])?;
    tx.execute(scripts::FLUSH_FRAMES, [frame_offset, document_offset])?;
    tx.execute(scripts::FLUSH_VOCABULARY, [])?;
    tx.execute(scripts::FLUSH_RESOLVE_POSTINGS, [frame_offset])?;
    tx.execute_batch(scripts::FLUSH_POSTINGS)?;
    tx.execute(scripts::FLUSH_FRAME_LENGTHS, [frame_offset])?;
    tx.execute_batch(scripts::FLUSH_ATTRIBUTES)?;
    tx.execute_batch(scripts::FLUSH_PLUGINS)?;
    let updated_plugins = {
        let mut stmt = tx.prepare(scripts::UPDATED_PLUGINS)?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        ids
    };
    tx.execute(scripts::FLUSH_SETTINGS, [])?;
    tx.execute(
        scripts::RECORD_REVISION,
        params![
            revision + 1,
            added_total + staged_documents,
            deleted_total + deleted_documents.len() as i64,
            frames_total + staged_frames
        ],
    )?;
    tx.commit()?;

    Ok(CommitSummary {
        added_documents: (document_offset..document_offset + staged_documents).collect(),
        deleted_documents,
        updated_plugins,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn staged_document(text_frames: &[&[&str]]) -> AnalyzedDocument {
        let frames = text_frames
            .iter()
            .enumerate()
            .map(|(i, _)| format!(r#"{{"field":"text","sequence_number":{i},"shell":{{}}}}"#))
            .collect();
        let terms = text_frames
            .iter()
            .map(|terms| terms.iter().map(|t| (*t).to_owned()).collect())
            .collect();
        AnalyzedDocument::V1 {
            document: "{}".into(),
            structured: BTreeMap::from([("year".to_owned(), Scalar::Integer(2001))]),
            frames: BTreeMap::from([("text".to_owned(), frames)]),
            frame_terms: BTreeMap::from([("text".to_owned(), terms)]),
        }
    }

    fn count(conn: &Connection, sql: &str) -> i64 {
        conn.query_row(sql, [], |row| row.get(0)).unwrap()
    }

    #[test]
    fn create_refuses_existing_and_open_requires_existing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        assert!(matches!(
            SqliteWriter::open(&path),
            Err(FramewiseError::StorageNotFound { .. })
        ));
        SqliteWriter::create(&path).unwrap().close().unwrap();
        assert!(matches!(
            SqliteWriter::create(&path),
            Err(FramewiseError::DuplicateStorage { .. })
        ));
        let writer = SqliteWriter::open(&path).unwrap();
        assert_eq!(writer.schema_version().unwrap(), i64::from(CURRENT_SCHEMA));
    }

    #[test]
    fn commit_assigns_ids_after_previous_revision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        let mut writer = SqliteWriter::create(&path).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat", "sat"], &["dog"]])).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat"]])).unwrap();
        let first = writer.commit().unwrap();
        assert_eq!(first.added_documents, vec![1, 2]);

        writer.add_analyzed_document(staged_document(&[&["cat"]])).unwrap();
        let second = writer.commit().unwrap();
        assert_eq!(second.added_documents, vec![3]);

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "select max(id) from frame"), 4);
        assert_eq!(count(&conn, "select max(revision_number) from index_revision"), 2);
        assert_eq!(
            count(
                &conn,
                "select frames_occurring from term_statistics ts \
                 join vocabulary v on v.id = ts.term_id where v.term = 'cat'"
            ),
            3
        );
        assert_eq!(count(&conn, "select frame_count from field_statistics"), 4);
    }

    #[test]
    fn mismatched_frames_roll_back_only_that_document() {
        let dir = TempDir::new().unwrap();
        let mut writer = SqliteWriter::create(dir.path().join("storage.db")).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat"]])).unwrap();

        let broken = AnalyzedDocument::V1 {
            document: "{}".into(),
            structured: BTreeMap::new(),
            frames: BTreeMap::from([("text".to_owned(), vec!["{}".to_owned(), "{}".to_owned()])]),
            frame_terms: BTreeMap::from([("text".to_owned(), vec![vec!["x".to_owned()]])]),
        };
        assert!(matches!(
            writer.add_analyzed_document(broken),
            Err(FramewiseError::InvalidDocument { .. })
        ));
        assert_eq!(writer.staged_documents(), 1);

        let summary = writer.commit().unwrap();
        assert_eq!(summary.added_documents, vec![1]);
    }

    #[test]
    fn deletes_update_statistics_and_revision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        let mut writer = SqliteWriter::create(&path).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat", "cat"]])).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat"]])).unwrap();
        writer.commit().unwrap();

        writer.delete_documents(&[1, 99]).unwrap();
        let summary = writer.commit().unwrap();
        assert_eq!(summary.deleted_documents, vec![1]);

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "select count(*) from document"), 1);
        assert_eq!(count(&conn, "select count(*) from frame"), 1);
        assert_eq!(count(&conn, "select frequency from term_statistics"), 1);
        assert_eq!(
            count(&conn, "select deleted_document_count from index_revision order by revision_number desc limit 1"),
            1
        );
    }

    #[test]
    fn rollback_discards_staged_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        let mut writer = SqliteWriter::create(&path).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        writer.add_analyzed_document(staged_document(&[&["cat"]])).unwrap();
        writer.set_setting("language", "en").unwrap();
        writer.rollback().unwrap();
        let summary = writer.commit().unwrap();
        assert!(summary.added_documents.is_empty());

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "select count(*) from setting"), 0);
    }

    #[test]
    fn plugin_delete_after_set_in_same_transaction_wins() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("storage.db");
        let mut writer = SqliteWriter::create(&path).unwrap();
        writer.begin(Duration::from_secs(1)).unwrap();
        let state = BTreeMap::from([("k".to_owned(), "v".to_owned())]);
        writer.set_plugin_state("counter", "{}", &state).unwrap();
        writer.set_plugin_state("counter", "{\"n\":2}", &state).unwrap();
        let summary = writer.commit().unwrap();
        assert_eq!(summary.updated_plugins.len(), 2);

        writer.set_plugin_state("counter", "{}", &state).unwrap();
        writer.delete_plugin_state("counter", None).unwrap();
        let summary = writer.commit().unwrap();
        assert!(summary.updated_plugins.is_empty());

        let conn = Connection::open(&path).unwrap();
        assert_eq!(count(&conn, "select count(*) from plugin_registry"), 0);
        assert_eq!(count(&conn, "select count(*) from plugin_data"), 0);
    }
}
