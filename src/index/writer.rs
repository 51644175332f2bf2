use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use super::analyse::analyse_document;
use crate::config::{ConfigFormat, IndexConfig};
use crate::constants::{DEFAULT_BUSY_TIMEOUT, LOCK_FILE};
use crate::error::{FramewiseError, Result};
use crate::lock::FileLock;
use crate::schema::{FieldType, Schema};
use crate::storage::SqliteWriter;
use crate::types::{CommitSummary, DocumentFields, DocumentId, FrameId, Plugin, PluginId, Scalar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Unopened,
    Begun,
    Committed,
    RolledBack,
    Closed,
}

/// Transactional write handle for one index directory.
///
/// Only one writer may be begun per index at a time; the others wait on (or
/// fail to take) the lock in `begin`. Dropping a begun writer rolls back and
/// releases the lock.
#[derive(Debug)]
pub struct IndexWriter {
    path: PathBuf,
    create_config: Option<IndexConfig>,
    config: Option<IndexConfig>,
    auto_migrate: bool,
    busy_timeout: Duration,
    state: WriterState,
    lock: Option<FileLock>,
    storage: Option<SqliteWriter>,
    last_summary: CommitSummary,
}

impl IndexWriter {
    /// Writer for an existing index.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !IndexConfig::exists(path) {
            return Err(FramewiseError::IndexNotFound {
                path: path.to_path_buf(),
                reason: "no config file".into(),
            });
        }
        Ok(Self::new(path, None))
    }

    /// Writer that creates the index from `config` on `begin` if none exists.
    pub fn open_or_create(path: impl AsRef<Path>, config: IndexConfig) -> Result<Self> {
        Ok(Self::new(path.as_ref(), Some(config)))
    }

    fn new(path: &Path, create_config: Option<IndexConfig>) -> Self {
        Self {
            path: path.to_path_buf(),
            create_config,
            config: None,
            auto_migrate: true,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            state: WriterState::Unopened,
            lock: None,
            storage: None,
            last_summary: CommitSummary::default(),
        }
    }

    /// Migrate an out-of-date store during `begin` (default) instead of failing.
    #[must_use]
    pub fn auto_migrate(mut self, enabled: bool) -> Self {
        self.auto_migrate = enabled;
        self
    }

    /// How long a commit waits for readers holding the store busy.
    #[must_use]
    pub fn busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Take the writer lock and open a transaction.
    ///
    /// `None` waits for the lock indefinitely, `Some(Duration::ZERO)` fails at
    /// once if it is held, and any other timeout polls until it elapses.
    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn begin(&mut self, timeout: Option<Duration>) -> Result<()> {
        if self.state != WriterState::Unopened {
            return Err(FramewiseError::invalid_state(format!(
                "cannot begin a writer in state {:?}",
                self.state
            )));
        }
        fs_err::create_dir_all(&self.path)?;
        let lock = FileLock::acquire(&self.path.join(LOCK_FILE), timeout)?;

        let config = match IndexConfig::load(&self.path) {
            Ok((config, ConfigFormat::Current)) => config,
            Ok((config, ConfigFormat::Legacy)) => {
                config.save(&self.path)?;
                info!("legacy config rewritten in the current format");
                config
            }
            Err(FramewiseError::IndexNotFound { path, reason }) => match self.create_config.take() {
                Some(config) => {
                    self.create_index(&config)?;
                    config
                }
                None => return Err(FramewiseError::IndexNotFound { path, reason }),
            },
            Err(err) => return Err(err),
        };

        let mut storage = config.storage.open_writer(&self.path)?;
        match storage.begin(self.busy_timeout) {
            Err(FramewiseError::SchemaMismatch { on_disk, expected }) if self.auto_migrate => {
                info!(on_disk, expected, "store out of date, migrating");
                storage.migrate()?;
                storage.begin(self.busy_timeout)?;
            }
            other => other?,
        }

        self.config = Some(config);
        self.storage = Some(storage);
        self.lock = Some(lock);
        self.state = WriterState::Begun;
        Ok(())
    }

    fn create_index(&self, config: &IndexConfig) -> Result<()> {
        config.save(&self.path)?;
        let mut storage = config.storage.create_writer(&self.path)?;
        storage.begin(self.busy_timeout)?;
        let unstructured = config.schema.unstructured_fields();
        let structured = config.schema.structured_fields();
        storage.add_unstructured_fields(unstructured.iter().map(String::as_str))?;
        storage.add_structured_fields(structured.iter().map(String::as_str))?;
        storage.commit()?;
        storage.close()?;
        info!(path = %self.path.display(), fields = config.schema.len(), "index created");
        Ok(())
    }

    fn storage(&mut self) -> Result<&mut SqliteWriter> {
        if self.state != WriterState::Begun {
            return Err(FramewiseError::invalid_state(format!(
                "writer is not begun (state {:?})",
                self.state
            )));
        }
        self.storage
            .as_mut()
            .ok_or_else(|| FramewiseError::invalid_state("writer has no storage"))
    }

    pub fn schema(&self) -> Result<&Schema> {
        self.config
            .as_ref()
            .map(|config| &config.schema)
            .ok_or_else(|| FramewiseError::invalid_state("writer is not begun"))
    }

    /// Analyse and stage one document. A failure leaves the rest of the
    /// transaction untouched.
    pub fn add_document(&mut self, fields: &DocumentFields, frame_size: usize) -> Result<()> {
        let analysed = analyse_document(self.schema()?, fields, frame_size)?;
        self.storage()?.add_analyzed_document(analysed)
    }

    pub fn append_frame_attributes(
        &mut self,
        attributes: &BTreeMap<FrameId, BTreeMap<String, Scalar>>,
    ) -> Result<()> {
        self.storage()?.append_frame_attributes(attributes)
    }

    pub fn delete_document(&mut self, id: DocumentId) -> Result<()> {
        self.storage()?.delete_documents(&[id])
    }

    pub fn set_plugin_state(&mut self, plugin: &dyn Plugin) -> Result<()> {
        let state = plugin.state();
        let settings = plugin.settings();
        self.storage()?
            .set_plugin_state(plugin.plugin_type(), &settings, &state)
    }

    pub fn delete_plugin_instance(&mut self, plugin: &dyn Plugin) -> Result<()> {
        let settings = plugin.settings();
        self.storage()?
            .delete_plugin_state(plugin.plugin_type(), Some(&settings))
    }

    pub fn delete_plugin_type(&mut self, plugin_type: &str) -> Result<()> {
        self.storage()?.delete_plugin_state(plugin_type, None)
    }

    pub fn set_setting(&mut self, name: &str, value: &str) -> Result<()> {
        self.storage()?.set_setting(name, value)
    }

    /// Extend the schema. The config file is rewritten at once.
    pub fn add_fields<I, S>(&mut self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        let mut config = self
            .config
            .clone()
            .ok_or_else(|| FramewiseError::invalid_state("writer is not begun"))?;
        let mut added = Schema::new();
        for (name, field) in fields {
            let name = name.into();
            config.schema.add(name.clone(), field.clone())?;
            added.add(name, field)?;
        }

        let unstructured = added.unstructured_fields();
        let structured = added.structured_fields();
        let storage = self.storage()?;
        storage.add_unstructured_fields(unstructured.iter().map(String::as_str))?;
        storage.add_structured_fields(structured.iter().map(String::as_str))?;

        config.version = crate::FRAMEWISE_CORE_VERSION.to_owned();
        config.save(&self.path)?;
        info!(added = added.len(), "schema extended");
        self.config = Some(config);
        Ok(())
    }

    #[instrument(skip_all, fields(path = %self.path.display()))]
    pub fn commit(&mut self) -> Result<&CommitSummary> {
        let summary = self.storage()?.commit()?;
        self.last_summary = summary;
        self.state = WriterState::Committed;
        Ok(&self.last_summary)
    }

    pub fn rollback(&mut self) -> Result<()> {
        self.storage()?.rollback()?;
        self.state = WriterState::RolledBack;
        Ok(())
    }

    /// Roll back anything uncommitted and release storage and lock.
    pub fn close(&mut self) -> Result<()> {
        if self.state == WriterState::Begun {
            self.rollback()?;
        }
        let storage = self.storage.take().map_or(Ok(()), SqliteWriter::close);
        let lock = self.lock.take().map_or(Ok(()), FileLock::release);
        if self.state != WriterState::Unopened {
            self.state = WriterState::Closed;
        }
        storage.and(lock)
    }

    /// Run `op` inside a transaction: commit on `Ok`, roll back on `Err`.
    pub fn transact<T, F>(mut self, timeout: Option<Duration>, op: F) -> Result<T>
    where
        F: FnOnce(&mut IndexWriter) -> Result<T>,
    {
        self.begin(timeout)?;
        match op(&mut self) {
            Ok(value) => {
                self.commit()?;
                self.close()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(close_err) = self.close() {
                    warn!(%close_err, "closing writer after a failed transaction");
                }
                Err(err)
            }
        }
    }

    #[must_use]
    pub fn last_committed_documents(&self) -> &[DocumentId] {
        &self.last_summary.added_documents
    }

    #[must_use]
    pub fn last_deleted_documents(&self) -> &[DocumentId] {
        &self.last_summary.deleted_documents
    }

    #[must_use]
    pub fn last_updated_plugins(&self) -> &[PluginId] {
        &self.last_summary.updated_plugins
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if matches!(self.state, WriterState::Unopened | WriterState::Closed) {
            return;
        }
        if let Err(err) = self.close() {
            warn!(path = %self.path.display(), %err, "failed to close index writer");
        }
    }
}
